//! Ollama wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generation counters reported on the final record of a completion.
/// Durations are nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

/// One NDJSON record of a `/api/chat` or `/api/generate` response.
///
/// Only the fields needed for usage accounting are decoded; message content
/// is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRecord {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// Body of `POST /api/pull`
#[derive(Debug, Clone, Serialize)]
pub struct PullRequest<'a> {
    pub model: &'a str,
    pub stream: bool,
}

/// One NDJSON record of a `/api/pull` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    /// Set instead of `status` when the pull failed mid-stream
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `GET /api/tags`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub models: Vec<ListModel>,
}

/// A locally available model
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    /// Size on disk in bytes
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub modified_at: Option<String>,
}
