//! Typed error kinds for the ingestion and retrieval pipeline.
//!
//! Orchestration code returns `anyhow::Result` and attaches context; these
//! variants are the domain failures callers branch on (skip a record, retry a
//! transient call, degrade a retrieval path, abort a run).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FinderError {
    /// A raw record is malformed or lacks a required key. The record is
    /// skipped; the batch continues.
    #[error("invalid record: {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The embedding model call failed.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A vector came back with the wrong length for the pinned model.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The persistent store could not be reached. Store implementations
    /// other than SQLite report transient failures with this variant; raw
    /// `sqlx` errors are classified directly by [`is_transient`].
    #[error("store error: {0}")]
    Store(String),

    /// One retrieval sub-path failed.
    #[error("{path} retrieval failed: {reason}")]
    Query { path: String, reason: String },

    /// An external call exceeded its time bound.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Another ingestion run holds the writer lock for this site.
    #[error("an ingestion run is already active for site '{site_id}'")]
    IngestLocked { site_id: String },
}

impl FinderError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FinderError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FinderError::Timeout { .. }
                | FinderError::Store(_)
                | FinderError::Embedding(_)
                | FinderError::Query { .. }
        )
    }
}

/// Classify an `anyhow` error chain for retry decisions.
///
/// Typed [`FinderError`]s answer for themselves. Raw `sqlx` errors count as
/// transient when they look like connectivity or lock contention; anything
/// else (constraint violations, bad SQL) is permanent.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(fe) = cause.downcast_ref::<FinderError>() {
            return fe.is_transient();
        }
        if let Some(se) = cause.downcast_ref::<sqlx::Error>() {
            return match se {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db) => {
                    let msg = db.message();
                    msg.contains("locked") || msg.contains("busy")
                }
                _ => false,
            };
        }
        if cause.downcast_ref::<reqwest::Error>().is_some() {
            return true;
        }
    }
    false
}
