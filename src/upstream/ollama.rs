//! Ollama HTTP client

use async_trait::async_trait;
use futures::TryStreamExt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use super::{build_http_client, BackendError, ModelBackend};
use crate::api::{ListResponse, ProgressResponse, PullRequest};
use crate::config::UpstreamConfig;

/// Client for Ollama's model-management endpoints
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
    probe_client: reqwest::Client,
}

impl OllamaClient {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: config.base_url().to_string(),
            // Pulls of multi-GB models legitimately run for a long time
            client: build_http_client(config, None)?,
            probe_client: build_http_client(config, Some(Duration::from_secs(config.probe_timeout_seconds)))?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ModelBackend for OllamaClient {
    async fn is_running(&self) -> bool {
        match self.probe_client.get(&self.base_url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::error!(status = %resp.status(), url = %self.base_url, "Upstream liveness probe failed");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, url = %self.base_url, "Upstream liveness probe failed");
                false
            }
        }
    }

    async fn pull(
        &self,
        model: &str,
        progress: &mut (dyn for<'r> FnMut(&'r ProgressResponse) + Send),
    ) -> Result<(), BackendError> {
        let url = format!("{}/api/pull", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&PullRequest { model, stream: true })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let body = resp.bytes_stream().map_err(std::io::Error::other);
        let mut lines = BufReader::new(StreamReader::new(body)).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: ProgressResponse = serde_json::from_str(&line)?;
            if let Some(error) = record.error {
                return Err(BackendError::Remote(error));
            }
            progress(&record);
        }

        Ok(())
    }

    async fn list(&self) -> Result<ListResponse, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        Ok(resp.json::<ListResponse>().await?)
    }
}
