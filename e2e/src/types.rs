//! Shared types for the e2e test framework

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A mock response the backend will serve for the next completion request
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    /// Body chunks, each written as a separate frame
    pub chunks: Vec<String>,
    /// Abort the body with an error after the last chunk
    pub fail_after: bool,
}

impl MockResponse {
    /// NDJSON stream, one record per chunk
    pub fn ndjson(records: Vec<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/x-ndjson".to_string(),
            chunks: records.into_iter().map(|r| format!("{r}\n")).collect(),
            fail_after: false,
        }
    }

    /// NDJSON stream with explicit raw chunks (records may straddle chunks)
    pub fn raw_chunks(chunks: Vec<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/x-ndjson".to_string(),
            chunks,
            fail_after: false,
        }
    }

    /// Stream that dies mid-body after `chunks`
    pub fn truncated(chunks: Vec<String>) -> Self {
        Self {
            fail_after: true,
            ..Self::raw_chunks(chunks)
        }
    }

    /// Create an error response
    pub fn error(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            chunks: vec![body.into()],
            fail_after: false,
        }
    }
}

/// Shared state for the mock backend server
#[derive(Debug, Default)]
pub struct BackendState {
    /// Queue of responses to serve - tests push responses, backend pops and serves them
    pub response_queue: VecDeque<MockResponse>,
    /// All requests received by the backend (for inspection)
    pub received_requests: Vec<ReceivedRequest>,
    /// Usage events posted to the mock webhook
    pub webhook_events: Vec<WebhookEvent>,
    /// Models pulled via /api/pull, in order
    pub pulls: Vec<String>,
}

/// A request received by the mock backend
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl ReceivedRequest {
    /// Last value of a header (names are lowercase)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A usage event received by the mock webhook
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

pub type SharedBackendState = Arc<Mutex<BackendState>>;

/// Result of a non-streaming proxy request
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ProxyResponse {
    /// Get a nested field using dot notation (e.g. "models.0.name")
    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        let mut current = &self.body;
        for part in path.split('.') {
            current = if let Ok(idx) = part.parse::<usize>() {
                current.as_array()?.get(idx)?
            } else {
                current.as_object()?.get(part)?
            };
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str()
    }
}

/// Raw result of a streamed proxy request
#[derive(Debug)]
pub struct StreamResponse {
    pub status: u16,
    pub content_type: String,
    /// Every byte received before the stream ended
    pub body: Vec<u8>,
    /// Set when the stream ended with a read error instead of a clean EOF
    pub error: Option<String>,
}

impl StreamResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Non-empty NDJSON records parsed from the body; unparsable lines are skipped
    pub fn records(&self) -> Vec<serde_json::Value> {
        self.text()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Concatenated assistant message content of a chat stream
    pub fn accumulated_content(&self) -> String {
        self.records()
            .iter()
            .filter_map(|r| {
                r.pointer("/message/content")
                    .or_else(|| r.get("response"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .collect()
    }
}

/// Result of a single test case
#[derive(Debug)]
#[allow(dead_code)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}
