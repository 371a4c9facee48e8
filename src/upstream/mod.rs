//! The single upstream model server and the client used to manage it

mod ollama;

use async_trait::async_trait;
use std::time::Duration;

use crate::api::{ListResponse, ProgressResponse};
use crate::config::UpstreamConfig;

pub use ollama::OllamaClient;

/// Model-management operations the proxy needs from its upstream
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Liveness probe: true iff the upstream answered its base URL with a 2xx
    async fn is_running(&self) -> bool;

    /// Pull a model, calling `progress` for every progress record.
    /// Dropping the returned future aborts the pull.
    async fn pull(
        &self,
        model: &str,
        progress: &mut (dyn for<'r> FnMut(&'r ProgressResponse) + Send),
    ) -> Result<(), BackendError>;

    /// List locally available models
    async fn list(&self) -> Result<ListResponse, BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upstream reported: {0}")]
    Remote(String),

    #[error("Failed to decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Build an HTTP client for upstream connections with TLS configuration
///
/// Redirects are never followed; a reverse proxy hands them to the client.
pub fn build_http_client(config: &UpstreamConfig, timeout: Option<Duration>) -> Result<reqwest::Client, BackendError> {
    let mut client_builder = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(timeout) = timeout {
        client_builder = client_builder.timeout(timeout);
    }

    if let Some(ref tls) = config.tls {
        if tls.accept_invalid_certs {
            client_builder = client_builder.danger_accept_invalid_certs(true);
            tracing::warn!("TLS: Accepting invalid certificates (use only for development/testing)");
        }

        if let Some(ref ca_path) = tls.ca_cert_path {
            let ca_cert = std::fs::read(ca_path)?;
            let ca_cert = reqwest::Certificate::from_pem(&ca_cert)?;
            client_builder = client_builder.add_root_certificate(ca_cert);
            tracing::info!("TLS: Loaded custom CA certificate from {}", ca_path);
        }

        if let (Some(cert_path), Some(key_path)) = (&tls.client_cert_path, &tls.client_key_path) {
            let cert_pem = std::fs::read(cert_path)?;
            let key_pem = std::fs::read(key_path)?;
            let identity = reqwest::Identity::from_pem(&[cert_pem, key_pem].concat())?;
            client_builder = client_builder.identity(identity);
            tracing::info!("TLS: Loaded client certificate from {} for mTLS", cert_path);
        }
    }

    Ok(client_builder.build()?)
}
