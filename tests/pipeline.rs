//! End-to-end tests through the library: ingestion, hybrid retrieval,
//! conversation turns and the HTTP handlers, against real SQLite files and
//! the deterministic hash embedder.

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, TimeZone, Utc};
use content_finder::app::App;
use content_finder::config::{parse_config, Config};
use content_finder::conversation::{ConversationManager, TurnState, UNAVAILABLE_ANSWER};
use content_finder::db;
use content_finder::embedding::{Embedder, HashProvider};
use content_finder::error::FinderError;
use content_finder::generator::{AnswerContext, AnswerGenerator, TemplateGenerator};
use content_finder::ingest::{IngestOptions, Ingestor};
use content_finder::migrate;
use content_finder::models::{
    ContentObject, ConversationTurn, NaturalKey, ObjectRef, ObjectType, QueryRequest, QueryStatus,
    RawRecord, Role, SearchFilters,
};
use content_finder::planner::HybridPlanner;
use content_finder::server::{handle_query, handle_search, handle_stats, SearchRequest};
use content_finder::normalize::normalize_record;
use content_finder::store::{Candidate, IndexStore, RetrievalStore, SqliteStore, VectorSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ─── Fixtures ───────────────────────────────────────────────────────

struct Env {
    _tmp: TempDir,
    config: Config,
    store: SqliteStore,
    embedder: Arc<Embedder>,
}

async fn env() -> Env {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        "[db]\npath = \"{}\"\n[embedding]\ndims = 256\n",
        tmp.path().join("finder.sqlite").display()
    ))
    .unwrap();
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = SqliteStore::new(pool);
    let embedder = Arc::new(Embedder::new(
        Arc::new(HashProvider::new(256)),
        &config.embedding,
    ));
    Env {
        _tmp: tmp,
        config,
        store,
        embedder,
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn record(ty: &str, id: &str, title: &str, description: &str, project: &str) -> RawRecord {
    RawRecord {
        site_id: Some("s1".into()),
        object_type: Some(ty.into()),
        object_id: Some(id.into()),
        title: Some(title.into()),
        description: Some(description.into()),
        project_name: Some(project.into()),
        owner: Some("ana".into()),
        url: Some(format!("https://bi.example.test/{}", id)),
        ..Default::default()
    }
}

fn catalog() -> Vec<RawRecord> {
    vec![
        record("workbook", "w1", "Q3 Sales Dashboard", "Quarterly sales by region", "Finance"),
        record("view", "v1", "Regional Revenue", "Revenue split by country", "Finance"),
        record("datasource", "d1", "Customer Churn Extract", "Monthly churn and tenure", "Retention"),
        record("view", "v2", "Support Tickets", "Open tickets by priority", "Operations"),
    ]
}

async fn ingest(env: &Env, records: Vec<RawRecord>, run: &str, secs: i64) {
    let ingestor = Ingestor::new(
        Arc::new(env.store.clone()),
        Arc::clone(&env.embedder),
        &env.config.ingest,
    );
    let opts = IngestOptions {
        run_id: Some(run.into()),
        now: Some(t(secs)),
        ..Default::default()
    };
    ingestor
        .run(records.into_iter().map(Ok).collect(), &opts)
        .await
        .unwrap();
}

fn app(env: &Env) -> App {
    App::assemble(
        &env.config,
        env.store.clone(),
        Arc::clone(&env.embedder),
        Arc::new(TemplateGenerator),
    )
}

fn key(ty: ObjectType, id: &str) -> NaturalKey {
    NaturalKey {
        site_id: "s1".into(),
        object_type: ty,
        object_id: id.into(),
    }
}

async fn stored(env: &Env, ty: ObjectType, id: &str) -> ContentObject {
    env.store.get_object(&key(ty, id)).await.unwrap().unwrap().1
}

// ─── Failing collaborators ──────────────────────────────────────────

/// Delegates to SQLite but can make either retrieval path unreachable.
struct FlakyStore {
    inner: SqliteStore,
    fail_lexical: bool,
    fail_vectors: bool,
}

fn unreachable_store() -> anyhow::Error {
    FinderError::Store("connection refused".into()).into()
}

#[async_trait]
impl RetrievalStore for FlakyStore {
    async fn lexical_search(
        &self,
        fts_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if self.fail_lexical {
            return Err(unreachable_store());
        }
        self.inner.lexical_search(fts_query, filters, limit).await
    }

    async fn vector_generation(&self) -> Result<i64> {
        if self.fail_vectors {
            return Err(unreachable_store());
        }
        self.inner.vector_generation().await
    }

    async fn load_vectors(&self, model: &str) -> Result<VectorSnapshot> {
        self.inner.load_vectors(model).await
    }

    async fn hydrate(&self, ids: &[i64], filters: &SearchFilters) -> Result<HashMap<i64, ObjectRef>> {
        self.inner.hydrate(ids, filters).await
    }

    async fn get_object(&self, key: &NaturalKey) -> Result<Option<(i64, ContentObject)>> {
        self.inner.get_object(key).await
    }
}

fn flaky_manager(env: &Env, fail_lexical: bool, fail_vectors: bool) -> ConversationManager {
    let store = FlakyStore {
        inner: env.store.clone(),
        fail_lexical,
        fail_vectors,
    };
    let planner = HybridPlanner::new(
        Arc::new(store),
        Arc::clone(&env.embedder),
        &env.config.retrieval,
    )
    .with_backoff(Duration::from_millis(1));
    ConversationManager::new(Arc::new(planner), Arc::new(TemplateGenerator), &env.config)
}

struct BrokenGenerator;

#[async_trait]
impl AnswerGenerator for BrokenGenerator {
    fn name(&self) -> &str {
        "broken"
    }
    async fn generate(&self, _ctx: &AnswerContext<'_>) -> Result<String> {
        anyhow::bail!("model refused the request")
    }
}

fn query(q: &str, history: Vec<ConversationTurn>) -> QueryRequest {
    QueryRequest {
        query: q.into(),
        conversation_history: history,
        top_k: None,
        filters: SearchFilters::default(),
    }
}

// ─── Ingestion properties ───────────────────────────────────────────

#[tokio::test]
async fn test_sales_dashboard_scenario() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = app(&env);

    let outcome = app
        .planner
        .search("sales dashboard", None, &SearchFilters::default(), 10)
        .await;
    assert!(outcome.degraded.is_empty());
    let first = &outcome.results[0];
    assert_eq!(first.object.object_id, "w1");
    assert!(first.fused_score > 0.0);
    assert_eq!(first.rank, 1);
}

#[tokio::test]
async fn test_owner_only_change_keeps_text_and_embedding() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let before = stored(&env, ObjectType::Workbook, "w1").await;

    let mut changed = catalog();
    changed[0].owner = Some("bo".into());
    ingest(&env, changed, "r2", 300).await;
    let after = stored(&env, ObjectType::Workbook, "w1").await;

    assert_eq!(after.text_blob, before.text_blob);
    assert_eq!(after.embedding, before.embedding);
    assert!(after.embedding.is_some());
    assert_eq!(after.owner, "bo");
    assert_eq!(after.updated_at, Some(t(300)));

    // untouched objects keep their timestamp
    let v1 = stored(&env, ObjectType::View, "v1").await;
    assert_eq!(v1.updated_at, Some(t(0)));
}

#[tokio::test]
async fn test_double_ingest_one_row_per_key() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    ingest(&env, catalog(), "r2", 10).await;

    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        "SELECT object_type, object_id, COUNT(*) FROM objects GROUP BY site_id, object_type, object_id",
    )
    .fetch_all(env.store.pool())
    .await
    .unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|(_, _, n)| *n == 1));
}

// ─── Retrieval properties ───────────────────────────────────────────

#[tokio::test]
async fn test_same_query_same_order() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = app(&env);

    let a = app
        .planner
        .search("revenue by region", None, &SearchFilters::default(), 10)
        .await;
    let b = app
        .planner
        .search("revenue by region", None, &SearchFilters::default(), 10)
        .await;
    assert!(!a.results.is_empty());
    assert_eq!(a.results, b.results);
}

#[tokio::test]
async fn test_lexical_only_when_no_vectors() {
    let env = env().await;
    for raw in catalog() {
        let obj = normalize_record(&raw, None).unwrap();
        env.store.upsert_object(&obj, None, "r1", t(0)).await.unwrap();
    }
    let app = app(&env);

    let outcome = app
        .planner
        .search("revenue tickets", None, &SearchFilters::default(), 10)
        .await;
    assert!(outcome.degraded.is_empty());
    assert_eq!(outcome.semantic_candidates, 0);
    let ids: Vec<&str> = outcome
        .results
        .iter()
        .map(|r| r.object.object_id.as_str())
        .collect();
    // "revenue" hits v1 in title and description; "tickets" hits v2 the same way
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"v1") && ids.contains(&"v2"));
    assert!(outcome.results.iter().all(|r| r.semantic_score == 0.0));
    assert!((outcome.results[0].fused_score - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_filters_narrow_both_paths() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = app(&env);

    let filters = SearchFilters {
        project_name: Some("finance".into()),
        ..Default::default()
    };
    let outcome = app
        .planner
        .search("churn revenue sales", None, &filters, 10)
        .await;
    assert!(!outcome.results.is_empty());
    assert!(outcome
        .results
        .iter()
        .all(|r| r.object.project_name == "Finance"));
}

#[tokio::test]
async fn test_similar_excludes_self() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = app(&env);

    let similar = app
        .planner
        .similar(&key(ObjectType::Workbook, "w1"), 3)
        .await
        .unwrap();
    assert!(similar.iter().all(|r| r.object.object_id != "w1"));
}

#[tokio::test]
async fn test_soft_deleted_objects_are_not_returned() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    ingest(&env, catalog()[1..].to_vec(), "r2", 10).await;
    let app = app(&env);

    let outcome = app
        .planner
        .search("sales dashboard", None, &SearchFilters::default(), 10)
        .await;
    assert!(outcome.results.iter().all(|r| r.object.object_id != "w1"));
}

// ─── Conversation properties ────────────────────────────────────────

#[tokio::test]
async fn test_turn_appends_and_evicts_fifo() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = app(&env);

    let history: Vec<ConversationTurn> = (0..10)
        .map(|i| {
            if i % 2 == 0 {
                ConversationTurn::user(format!("t{}", i))
            } else {
                ConversationTurn::assistant(format!("t{}", i))
            }
        })
        .collect();

    let (response, trace) = app
        .conversation
        .ask_traced(&query("sales dashboard", history))
        .await;

    assert_eq!(response.status, QueryStatus::FoundResults);
    assert_eq!(response.conversation_history.len(), 10);
    assert_eq!(response.conversation_history[0].content, "t2");
    assert_eq!(response.conversation_history[8].role, Role::User);
    assert_eq!(response.conversation_history[8].content, "sales dashboard");
    assert_eq!(response.conversation_history[9].role, Role::Assistant);
    assert_eq!(response.conversation_history[9].content, response.answer);
    assert_eq!(response.results[0].title, "Q3 Sales Dashboard");
    assert_eq!(
        trace.states(),
        &[
            TurnState::Received,
            TurnState::Searching,
            TurnState::FoundResults,
            TurnState::ResponseGenerated,
            TurnState::Appended
        ]
    );
}

#[tokio::test]
async fn test_no_results_turn_is_still_appended() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = app(&env);

    let response = app.conversation.ask(&query("zzzqqq xylophone", vec![])).await;
    assert_eq!(response.status, QueryStatus::NoResults);
    assert!(response.results.is_empty());
    assert_eq!(response.conversation_history.len(), 2);
}

#[tokio::test]
async fn test_one_failed_path_degrades() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;

    let manager = flaky_manager(&env, true, false);
    let response = manager.ask(&query("sales dashboard", vec![])).await;
    assert_eq!(response.status, QueryStatus::FoundResults);
    assert_eq!(response.degraded, vec!["lexical".to_string()]);
    assert_eq!(response.results[0].title, "Q3 Sales Dashboard");
}

#[tokio::test]
async fn test_both_paths_failing_is_unavailable() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;

    let manager = flaky_manager(&env, true, true);
    let history = vec![
        ConversationTurn::user("where is churn"),
        ConversationTurn::assistant("Customer Churn Extract in Retention."),
    ];
    let (response, trace) = manager
        .ask_traced(&query("and revenue?", history.clone()))
        .await;

    assert_eq!(response.status, QueryStatus::Unavailable);
    assert_eq!(response.answer, UNAVAILABLE_ANSWER);
    assert!(response.results.is_empty());
    assert_eq!(response.conversation_history, history);
    assert_eq!(trace.current(), TurnState::Error);
}

#[tokio::test]
async fn test_unavailable_returns_history_beyond_max_turns_unchanged() {
    let env = env().await;
    let manager = flaky_manager(&env, true, true);
    let history: Vec<ConversationTurn> = (0..6)
        .flat_map(|i| {
            [
                ConversationTurn::user(format!("question {}", i)),
                ConversationTurn::assistant(format!("answer {}", i)),
            ]
        })
        .collect();
    assert!(history.len() > env.config.conversation.max_turns);

    let response = manager.ask(&query("anything else?", history.clone())).await;
    assert_eq!(response.status, QueryStatus::Unavailable);
    assert_eq!(response.conversation_history.len(), 12);
    assert_eq!(response.conversation_history, history);
}

#[tokio::test]
async fn test_generator_failure_falls_back_to_template() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = App::assemble(
        &env.config,
        env.store.clone(),
        Arc::clone(&env.embedder),
        Arc::new(BrokenGenerator),
    );

    let response = app.conversation.ask(&query("sales dashboard", vec![])).await;
    assert_eq!(response.status, QueryStatus::FoundResults);
    assert!(response.degraded.contains(&"generator".to_string()));
    assert!(response.answer.contains("Q3 Sales Dashboard"));
    assert_eq!(response.conversation_history.len(), 2);
}

// ─── HTTP handlers ──────────────────────────────────────────────────

#[tokio::test]
async fn test_query_handler_rejects_empty_query() {
    let env = env().await;
    let app = Arc::new(app(&env));

    let err = handle_query(State(app), Json(query("  ", vec![])))
        .await
        .unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(err.code(), "bad_request");
}

#[tokio::test]
async fn test_search_and_stats_handlers() {
    let env = env().await;
    ingest(&env, catalog(), "r1", 0).await;
    let app = Arc::new(app(&env));

    let Json(found) = handle_search(
        State(Arc::clone(&app)),
        Json(SearchRequest {
            query: "customer churn".into(),
            top_k: Some(2),
            filters: SearchFilters::default(),
        }),
    )
    .await
    .unwrap();
    assert!(found.results.len() <= 2);
    assert_eq!(found.results[0].object.object_id, "d1");

    let Json(stats) = handle_stats(State(app)).await.unwrap();
    assert_eq!(stats.active, 4);
    assert_eq!(stats.embedded, 4);
}
