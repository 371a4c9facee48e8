//! HTTP proxy server

mod context;
mod handler;
mod ping;
pub mod server;
mod streaming;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use crate::config::ConfigError;
use crate::upstream::BackendError;

pub use context::{IdentityHeaders, RequestContext};
pub use handler::ProxyHandler;
pub use ping::{PingStatus, ProbeClock};
pub use server::{build_ping_router, build_router, run_server, ProxyState};
pub use streaming::{is_record_content_type, relay_chunks, relay_records, RelayEnd, RelaySummary, UsageObserver};

/// Failure to proxy a single request
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to reach upstream: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Upstream(_) => (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}\n", self)).into_response(),
        }
    }
}

/// Failure to start or run the listeners
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build upstream client: {0}")]
    Client(#[from] BackendError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
