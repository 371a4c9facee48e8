//! HTTP webhook exporter

use async_trait::async_trait;
use axum::http::header;
use std::time::Duration;

use super::{ExportError, MetricsExporter};
use crate::config::MetricsConfig;
use crate::stats::UserModelMetrics;

/// POSTs each event as a JSON document to a fixed URL
pub struct WebhookExporter {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl WebhookExporter {
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExportError::Config(e.to_string()))?;
        Ok(Self { client, url, api_key })
    }

    /// Create from app config; `None` when no webhook URL is configured
    pub fn from_config(config: &MetricsConfig) -> Result<Option<Self>, ExportError> {
        match config.webhook_url {
            Some(ref url) => Self::new(
                url.clone(),
                config.webhook_api_key.clone(),
                Duration::from_secs(config.timeout_seconds),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MetricsExporter for WebhookExporter {
    async fn export(&self, event: &UserModelMetrics) -> Result<(), ExportError> {
        let body = serde_json::to_vec(event)?;

        let mut request = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExportError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        tracing::debug!(url = %self.url, status = %status, "Webhook accepted usage event");
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::testing::event;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink {
        received: Arc<Mutex<Vec<(Option<String>, Option<String>, serde_json::Value)>>>,
    }

    async fn start_sink(status: StatusCode) -> (String, Sink) {
        let sink = Sink::default();
        let app = Router::new()
            .route(
                "/hook",
                post(move |State(sink): State<Sink>, headers: HeaderMap, body: String| async move {
                    let auth = headers
                        .get(header::AUTHORIZATION)
                        .map(|v| v.to_str().unwrap().to_string());
                    let ct = headers
                        .get(header::CONTENT_TYPE)
                        .map(|v| v.to_str().unwrap().to_string());
                    let json = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
                    sink.received.lock().unwrap().push((auth, ct, json));
                    (status, "sink says no")
                }),
            )
            .with_state(sink.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/hook", addr), sink)
    }

    #[test]
    fn test_from_config_without_url() {
        assert!(WebhookExporter::from_config(&MetricsConfig::default()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_posts_json_with_bearer_key() {
        let (url, sink) = start_sink(StatusCode::NO_CONTENT).await;
        let exporter = WebhookExporter::new(url, Some("hook-key".to_string()), Duration::from_secs(5)).unwrap();

        exporter.export(&event("llama3.2")).await.unwrap();

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (auth, ct, json) = &received[0];
        assert_eq!(auth.as_deref(), Some("Bearer hook-key"));
        assert_eq!(ct.as_deref(), Some("application/json"));
        assert_eq!(json["model"], "llama3.2");
    }

    #[tokio::test]
    async fn test_no_auth_header_without_key() {
        let (url, sink) = start_sink(StatusCode::OK).await;
        let exporter = WebhookExporter::new(url, None, Duration::from_secs(5)).unwrap();

        exporter.export(&event("m")).await.unwrap();

        assert!(sink.received.lock().unwrap()[0].0.is_none());
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let (url, _sink) = start_sink(StatusCode::INTERNAL_SERVER_ERROR).await;
        let exporter = WebhookExporter::new(url, None, Duration::from_secs(5)).unwrap();

        match exporter.export(&event("m")).await {
            Err(ExportError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "sink says no");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_connection_error() {
        let exporter =
            WebhookExporter::new("http://127.0.0.1:9/hook".to_string(), None, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            exporter.export(&event("m")).await,
            Err(ExportError::Connection(_))
        ));
    }
}
