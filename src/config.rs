//! TOML configuration parsing and validation.
//!
//! Every section carries serde defaults, so the smallest valid file is:
//!
//! ```toml
//! [db]
//! path = "./data/finder.sqlite"
//! ```
//!
//! See [`parse_config`] for the validation rules applied after parsing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            workers: default_workers(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_workers() -> usize {
    2
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_lexical: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_semantic: usize,
    #[serde(default = "default_min_similarity")]
    pub min_semantic_similarity: f64,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Prior user turns folded into the text embedded for the semantic path.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Vector sets smaller than this are scanned exactly.
    #[serde(default = "default_ann_min_vectors")]
    pub ann_min_vectors: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_weight: default_weight(),
            semantic_weight: default_weight(),
            top_k: default_top_k(),
            candidate_k_lexical: default_candidate_k(),
            candidate_k_semantic: default_candidate_k(),
            min_semantic_similarity: default_min_similarity(),
            query_timeout_secs: default_query_timeout_secs(),
            history_turns: default_history_turns(),
            ann_min_vectors: default_ann_min_vectors(),
        }
    }
}

fn default_weight() -> f64 {
    0.5
}
fn default_top_k() -> usize {
    10
}
fn default_candidate_k() -> usize {
    50
}
fn default_min_similarity() -> f64 {
    0.3
}
fn default_query_timeout_secs() -> u64 {
    10
}
fn default_history_turns() -> usize {
    1
}
fn default_ann_min_vectors() -> usize {
    2048
}

impl RetrievalConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

fn default_max_turns() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generator_retries")]
    pub max_retries: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator(),
            model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_generator_retries(),
        }
    }
}

fn default_generator() -> String {
    "template".to_string()
}
fn default_generator_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: i64,
    #[serde(default = "default_max_retries")]
    pub store_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            store_retries: default_max_retries(),
        }
    }
}

fn default_lock_ttl_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let r = &config.retrieval;
    if r.lexical_weight < 0.0 || r.semantic_weight < 0.0 {
        bail!("retrieval weights must be >= 0.0");
    }
    if r.lexical_weight + r.semantic_weight <= 0.0 {
        bail!("retrieval.lexical_weight and retrieval.semantic_weight cannot both be 0");
    }
    if r.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&r.min_semantic_similarity) {
        bail!("retrieval.min_semantic_similarity must be in [-1.0, 1.0]");
    }

    if config.conversation.max_turns < 1 {
        bail!("conversation.max_turns must be >= 1");
    }

    let e = &config.embedding;
    if e.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if e.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if e.workers == 0 {
        bail!("embedding.workers must be > 0");
    }
    match e.provider.as_str() {
        "hash" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
            other
        ),
    }
    if matches!(e.provider.as_str(), "openai" | "ollama") && e.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            e.provider
        );
    }

    match config.generator.provider.as_str() {
        "template" | "openai" => {}
        other => bail!(
            "Unknown generator provider: '{}'. Must be template or openai.",
            other
        ),
    }

    Ok(config)
}
