//! Process-wide service wiring.
//!
//! [`App::open`] builds the store, the embedding model, the planner and the
//! conversation manager once. The CLI and the HTTP server share the same
//! instance; the embedding model is loaded a single time and dropped with
//! the `App`.

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::conversation::ConversationManager;
use crate::embedding::Embedder;
use crate::generator::create_generator;
use crate::planner::HybridPlanner;
use crate::store::SqliteStore;

pub struct App {
    pub config: Arc<Config>,
    pub store: SqliteStore,
    pub embedder: Arc<Embedder>,
    pub planner: Arc<HybridPlanner>,
    pub conversation: Arc<ConversationManager>,
}

impl App {
    pub async fn open(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(config).await?;
        let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
        let generator = create_generator(&config.generator)?;
        Ok(Self::assemble(config, store, embedder, generator))
    }

    /// Wire already-built parts together.
    pub fn assemble(
        config: &Config,
        store: SqliteStore,
        embedder: Arc<Embedder>,
        generator: Arc<dyn crate::generator::AnswerGenerator>,
    ) -> Self {
        let planner = Arc::new(HybridPlanner::new(
            Arc::new(store.clone()),
            Arc::clone(&embedder),
            &config.retrieval,
        ));
        let conversation = Arc::new(ConversationManager::new(
            Arc::clone(&planner),
            generator,
            config,
        ));
        Self {
            config: Arc::new(config.clone()),
            store,
            embedder,
            planner,
            conversation,
        }
    }

    pub async fn close(&self) {
        self.store.pool().close().await;
    }
}
