//! Embedding providers and the shared [`Embedder`] service.
//!
//! Providers implement [`EmbeddingProvider`]:
//! - **[`HashProvider`]**: deterministic feature hashing; offline, the default.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` on the OpenAI API.
//! - **[`OllamaProvider`]**: `POST /api/embed` on a local Ollama instance.
//! - **`LocalProvider`**: fastembed inference (feature `local-embeddings-fastembed`).
//!
//! Providers make exactly one attempt per call. Timeouts, retries and
//! dimension checks live in [`Embedder`], which is built once per process and
//! shared by reference between ingestion and query serving.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → transient, retried
//! - HTTP 4xx (client error, not 429) → permanent, fail immediately
//! - Network errors and timeouts → transient, retried
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Also provides vector utilities: [`cosine_similarity`], [`vec_to_blob`]
//! and [`blob_to_vec`].

pub mod hash;
#[cfg(feature = "local-embeddings-fastembed")]
pub mod local;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::EmbeddingConfig;
use crate::error::FinderError;
use crate::retry::{with_retry, RetryPolicy};

pub use hash::{HashProvider, HASH_MODEL_ID};

/// A text embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Pinned model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Expected vector length.
    fn dims(&self) -> usize;
    /// Embed a batch, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            model,
            dims: config.dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| FinderError::Embedding(format!("OpenAI request failed: {}", e)))?;

        let json = read_json("OpenAI", resp).await?;
        parse_openai_response(&json)
    }
}

/// Map an HTTP response to JSON, classifying failures for retry.
async fn read_json(service: &str, response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body_text = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(FinderError::Embedding(format!(
            "{} API error {}: {}",
            service, status, body_text
        ))
        .into());
    }
    bail!("{} API error {}: {}", service, status, body_text)
}

/// Extract `data[].embedding`, ordered by `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_floats(embedding)));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance
/// (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            model,
            dims: config.dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                FinderError::Embedding(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let json = read_json("Ollama", resp).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|a| json_floats(a))
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

/// Instantiate the provider named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashProvider::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(local::LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Embedder service ============

/// Process-wide embedding service.
///
/// Wraps one provider with the configured batch size, worker bound and
/// retry policy. Cloning is cheap and shares the provider.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    workers: usize,
    policy: RetryPolicy,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            workers: config.workers.max(1),
            policy: RetryPolicy::new(config.max_retries, config.timeout()),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(create_provider(config)?, config))
    }

    pub fn with_backoff(mut self, base_delay: Duration) -> Self {
        self.policy = self.policy.with_base_delay(base_delay);
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| FinderError::Embedding("empty embedding response".into()).into())
    }

    /// Embed one batch with timeout, retry and dimension check.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_checked(self.provider.as_ref(), &self.policy, texts).await
    }

    /// Embed many texts in disjoint batches over at most `workers`
    /// concurrent tasks.
    ///
    /// A failing batch is retried item by item; items that still fail are
    /// logged and come back as `None`. A [`FinderError::DimensionMismatch`]
    /// aborts the whole call.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        if texts.is_empty() {
            return Ok(out);
        }

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let offset = batch_no * self.batch_size;
            let batch = batch.to_vec();
            let provider = Arc::clone(&self.provider);
            let policy = self.policy;
            let permits = Arc::clone(&permits);

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                let vectors = embed_with_fallback(provider.as_ref(), &policy, &batch).await?;
                Ok::<_, anyhow::Error>((offset, vectors))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (offset, vectors) = match joined? {
                Ok(v) => v,
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            };
            for (i, v) in vectors.into_iter().enumerate() {
                out[offset + i] = v;
            }
        }

        Ok(out)
    }
}

async fn embed_checked(
    provider: &dyn EmbeddingProvider,
    policy: &RetryPolicy,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let vectors = with_retry("embedding", policy, || provider.embed(texts)).await?;

    if vectors.len() != texts.len() {
        return Err(FinderError::Embedding(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        ))
        .into());
    }

    let expected = provider.dims();
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(FinderError::DimensionMismatch {
            expected,
            actual: bad.len(),
        }
        .into());
    }

    Ok(vectors)
}

async fn embed_with_fallback(
    provider: &dyn EmbeddingProvider,
    policy: &RetryPolicy,
    batch: &[String],
) -> Result<Vec<Option<Vec<f32>>>> {
    match embed_checked(provider, policy, batch).await {
        Ok(vectors) => Ok(vectors.into_iter().map(Some).collect()),
        Err(e) if is_dimension_mismatch(&e) => Err(e),
        Err(e) if batch.len() == 1 => {
            tracing::warn!(error = %e, "embedding failed, item skipped");
            Ok(vec![None])
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                batch_len = batch.len(),
                "batch embedding failed, retrying items individually"
            );
            let mut out = Vec::with_capacity(batch.len());
            for text in batch {
                match embed_checked(provider, policy, std::slice::from_ref(text)).await {
                    Ok(mut v) => out.push(v.pop()),
                    Err(e) if is_dimension_mismatch(&e) => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "embedding failed, item skipped");
                        out.push(None);
                    }
                }
            }
            Ok(out)
        }
    }
}

pub fn is_dimension_mismatch(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<FinderError>(),
        Some(FinderError::DimensionMismatch { .. })
    )
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, zero or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
