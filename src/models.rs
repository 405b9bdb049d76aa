//! Core data models used throughout the finder.
//!
//! These types represent the raw upstream records, the canonical indexed
//! objects, conversation turns, and the search results that flow through the
//! ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::FinderError;

/// Kind of content an object represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    View,
    Workbook,
    Datasource,
}

impl ObjectType {
    pub const ALL: [ObjectType; 3] = [ObjectType::View, ObjectType::Workbook, ObjectType::Datasource];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::View => "view",
            ObjectType::Workbook => "workbook",
            ObjectType::Datasource => "datasource",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = FinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "view" => Ok(ObjectType::View),
            "workbook" => Ok(ObjectType::Workbook),
            "datasource" => Ok(ObjectType::Datasource),
            other => Err(FinderError::validation(
                "object_type",
                format!("unknown object type '{}'", other),
            )),
        }
    }
}

/// A tag or field as delivered upstream: either a bare string or an object
/// carrying a `name`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NamedValue {
    Plain(String),
    Named { name: String },
}

impl NamedValue {
    pub fn name(&self) -> &str {
        match self {
            NamedValue::Plain(s) => s,
            NamedValue::Named { name } => name,
        }
    }
}

/// Raw record from the upstream metadata provider, before normalization.
///
/// Every field is optional at this layer so that a missing required key
/// surfaces as a validation failure for that one record instead of a parse
/// failure for the whole batch.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawRecord {
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default, alias = "id")]
    pub object_id: Option<String>,
    #[serde(default, alias = "name")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<NamedValue>>,
    #[serde(default)]
    pub fields: Option<Vec<NamedValue>>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Domain uniqueness constraint of a [`ContentObject`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NaturalKey {
    pub site_id: String,
    pub object_type: ObjectType,
    pub object_id: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.site_id, self.object_type, self.object_id)
    }
}

/// Canonical indexable object.
///
/// Produced by [`crate::normalize`] with `embedding` and `updated_at` unset;
/// the store fills both when the object is read back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentObject {
    pub site_id: String,
    pub object_type: ObjectType,
    pub object_id: String,
    pub title: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub fields: Vec<String>,
    pub project_name: String,
    pub owner: String,
    pub url: String,
    pub text_blob: String,
    /// SHA-256 of `text_blob`; drives embedding freshness.
    pub text_hash: String,
    /// SHA-256 over every stored attribute; drives `updated_at`.
    pub record_hash: String,
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl ContentObject {
    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            site_id: self.site_id.clone(),
            object_type: self.object_type,
            object_id: self.object_id.clone(),
        }
    }
}

/// Lightweight reference to a stored object, carried by search results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRef {
    pub site_id: String,
    pub object_type: ObjectType,
    pub object_id: String,
    pub title: String,
    pub url: String,
    pub project_name: String,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRef {
    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            site_id: self.site_id.clone(),
            object_type: self.object_type,
            object_id: self.object_id.clone(),
        }
    }
}

/// A fused, ranked result. Produced per query and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub object: ObjectRef,
    /// Min-max normalized lexical score, `0.0` when the lexical path missed.
    pub lexical_score: f64,
    /// Min-max normalized semantic score, `0.0` when the semantic path missed.
    pub semantic_score: f64,
    pub fused_score: f64,
    /// 1-based position in the fused order.
    pub rank: usize,
}

/// Optional narrowing applied to both retrieval paths.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub object_type: Option<ObjectType>,
    /// Case-insensitive substring match on the project name.
    #[serde(default)]
    pub project_name: Option<String>,
}

/// One of the two retrieval signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalPath {
    Lexical,
    Semantic,
}

impl fmt::Display for RetrievalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalPath::Lexical => f.write_str("lexical"),
            RetrievalPath::Semantic => f.write_str("semantic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Query input accepted by the conversational entry points.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: SearchFilters,
}

/// Outcome of a conversational turn as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    FoundResults,
    NoResults,
    /// Neither retrieval path could be reached; history was not modified.
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    pub title: String,
    pub url: String,
    pub project_name: String,
    pub fused_score: f64,
}

impl From<&SearchResult> for ResultSummary {
    fn from(r: &SearchResult) -> Self {
        Self {
            title: r.object.title.clone(),
            url: r.object.url.clone(),
            project_name: r.object.project_name.clone(),
            fused_score: r.fused_score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub conversation_history: Vec<ConversationTurn>,
    pub results: Vec<ResultSummary>,
    pub status: QueryStatus,
    /// Collaborators or retrieval paths that failed and were worked around.
    pub degraded: Vec<String>,
}
