//! Readiness endpoint combining upstream liveness with preload state

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::server::ProxyState;
use crate::preload::PreloadState;

/// Successful pings closer together than this are logged at debug
const QUIET_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
pub struct PingStatus {
    pub status: &'static str,
}

/// Remembers when the upstream last answered a ping
#[derive(Debug, Default)]
pub struct ProbeClock {
    // Unix millis; 0 = never
    last_success_ms: AtomicI64,
}

impl ProbeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a success at `now`; returns the time since the previous one
    pub fn record_success(&self, now: DateTime<Utc>) -> Option<Duration> {
        let now_ms = now.timestamp_millis();
        let previous = self.last_success_ms.swap(now_ms, Ordering::AcqRel);
        if previous == 0 {
            return None;
        }
        Some(Duration::from_millis(now_ms.saturating_sub(previous).max(0) as u64))
    }
}

/// 503 while the upstream is down, 204 until preload finishes, then 200
pub async fn ping_handler(State(state): State<ProxyState>) -> Response {
    if !state.backend.is_running().await {
        tracing::warn!("Upstream is not running");
        return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({}))).into_response();
    }

    let since_last = state.probe_clock.record_success(Utc::now());

    match state.preload.get() {
        PreloadState::Unknown => {
            tracing::warn!("Model preload not started yet");
            StatusCode::NO_CONTENT.into_response()
        }
        PreloadState::InProgress => {
            tracing::info!("Model preload in progress");
            StatusCode::NO_CONTENT.into_response()
        }
        PreloadState::Preloaded => {
            if since_last.map_or(true, |d| d > QUIET_PERIOD) {
                tracing::info!("Models preloaded, upstream is ready");
            } else {
                tracing::debug!("Models preloaded, upstream is ready");
            }
            (StatusCode::OK, Json(PingStatus { status: "Models preloaded" })).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_clock() {
        let clock = ProbeClock::new();
        let t0 = Utc::now();
        assert_eq!(clock.record_success(t0), None);
        assert_eq!(
            clock.record_success(t0 + chrono::Duration::seconds(5)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            clock.record_success(t0 + chrono::Duration::seconds(125)),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_ping_status_body() {
        let body = serde_json::to_string(&PingStatus { status: "Models preloaded" }).unwrap();
        assert_eq!(body, r#"{"status":"Models preloaded"}"#);
    }
}
