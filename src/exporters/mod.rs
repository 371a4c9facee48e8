//! Usage metrics export
//!
//! Request handlers hand finished [`UserModelMetrics`] to a [`MetricsForwarder`],
//! which queues them for a single worker task. The worker is the only place a
//! network call to the sink happens, so a slow or broken sink never holds up
//! a proxied response.

mod webhook;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::stats::UserModelMetrics;

pub use webhook::WebhookExporter;

/// Trait for metrics exporters
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Deliver one event to the destination
    async fn export(&self, event: &UserModelMetrics) -> Result<(), ExportError>;

    /// Name of the exporter
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Sink returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Fire-and-forget handle onto the metrics queue
///
/// Cloning is cheap; all clones feed the same worker.
#[derive(Clone)]
pub struct MetricsForwarder {
    tx: Option<mpsc::Sender<UserModelMetrics>>,
}

impl MetricsForwarder {
    /// A forwarder that drops every event (no sink configured)
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the worker task and return the handle that feeds it.
    ///
    /// The worker runs until the last clone of the returned forwarder is
    /// dropped, then exits once everything queued has been delivered. Requests
    /// still streaming during shutdown hold a clone, so their events are not
    /// lost.
    pub fn spawn(exporter: Arc<dyn MetricsExporter>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(exporter, rx));
        (Self { tx: Some(tx) }, handle)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an event without waiting
    pub fn submit(&self, event: UserModelMetrics) {
        let Some(ref tx) = self.tx else {
            tracing::debug!(model = %event.model, "No metrics sink configured, skipping usage event");
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(model = %event.model, "Metrics queue full, dropping usage event");
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(model = %event.model, "Metrics forwarder stopped, dropping usage event");
            }
        }
    }
}

async fn run_worker(exporter: Arc<dyn MetricsExporter>, mut rx: mpsc::Receiver<UserModelMetrics>) {
    tracing::debug!(exporter = exporter.name(), "Metrics forwarder started");

    let mut delivered = 0usize;
    while let Some(event) = rx.recv().await {
        deliver(exporter.as_ref(), &event).await;
        delivered += 1;
    }
    tracing::info!(exporter = exporter.name(), delivered, "Metrics forwarder stopped");
}

async fn deliver(exporter: &dyn MetricsExporter, event: &UserModelMetrics) {
    match exporter.export(event).await {
        Ok(()) => {
            tracing::debug!(exporter = exporter.name(), model = %event.model, "Usage event exported");
        }
        Err(e) => {
            tracing::error!(
                exporter = exporter.name(),
                model = %event.model,
                error = %e,
                "Failed to export usage event"
            );
        }
    }
}
