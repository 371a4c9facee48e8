//! ollama-auth-proxy: authenticating streaming reverse proxy for Ollama
//!
//! Features:
//! - Bearer API-key gate in front of every route
//! - Streaming passthrough with per-user usage metrics read off the final record
//! - Model preload on startup and a readiness ping for load balancers
//! - Fire-and-forget delivery of usage events to a webhook

pub mod api;
pub mod auth;
pub mod config;
pub mod exporters;
pub mod preload;
pub mod proxy;
pub mod stats;
pub mod upstream;

pub use config::AppConfig;
pub use proxy::run_server;
