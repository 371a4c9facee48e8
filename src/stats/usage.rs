//! Usage events built from the final record of a completion

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::{CompletionRecord, Metrics};

/// Who made a request, as far as the front-end told us
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

/// One usage event, delivered to the metrics webhook as a flat JSON document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserModelMetrics {
    pub created_at: DateTime<Utc>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

impl UserModelMetrics {
    /// Build the event for a terminal (`done: true`) record
    pub fn from_record(record: &CompletionRecord, identity: &CallerIdentity) -> Self {
        Self {
            created_at: record.created_at.unwrap_or_else(Utc::now),
            model: record.model.clone(),
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
            metrics: record.metrics.clone(),
        }
    }

    /// Generation speed, if the record carried both counters
    pub fn eval_tokens_per_second(&self) -> Option<f64> {
        match (self.metrics.eval_count, self.metrics.eval_duration) {
            (Some(count), Some(ns)) if ns > 0 => Some(count as f64 / (ns as f64 / 1_000_000_000.0)),
            _ => None,
        }
    }

    /// Compact single-line summary for logs
    pub fn summary(&self) -> String {
        let tps = self
            .eval_tokens_per_second()
            .map(|t| format!("{:.1}", t))
            .unwrap_or_else(|| "N/A".to_string());
        format!(
            "model={} user={} tokens={}/{} tps={} dur={:.1}ms",
            self.model,
            self.user_name.as_deref().or(self.user_id.as_deref()).unwrap_or("-"),
            self.metrics.prompt_eval_count.unwrap_or(0),
            self.metrics.eval_count.unwrap_or(0),
            tps,
            self.metrics.total_duration.unwrap_or(0) as f64 / 1_000_000.0,
        )
    }
}
