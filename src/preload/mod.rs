//! Upstream warm-up: wait for the upstream, then pull the configured models

mod progress;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::ProgressResponse;
use crate::upstream::ModelBackend;

pub use progress::{format_gb, PullProgress};

/// Lifecycle of the model preload
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadState {
    /// The upstream has not been seen running yet
    Unknown = 0,
    /// Models are being pulled
    InProgress = 1,
    /// Every configured model has been attempted
    Preloaded = 2,
}

impl PreloadState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PreloadState::InProgress,
            2 => PreloadState::Preloaded,
            _ => PreloadState::Unknown,
        }
    }
}

/// Shared preload state: written by the coordinator, read by ping handlers
#[derive(Debug, Default)]
pub struct PreloadStatus {
    state: AtomicU8,
}

impl PreloadStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> PreloadState {
        PreloadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move one step forward to `next`.
    ///
    /// Returns false (and changes nothing) for anything other than
    /// `Unknown -> InProgress` or `InProgress -> Preloaded`.
    pub fn advance(&self, next: PreloadState) -> bool {
        let expected = match next {
            PreloadState::InProgress => PreloadState::Unknown,
            PreloadState::Preloaded => PreloadState::InProgress,
            PreloadState::Unknown => return false,
        };
        self.state
            .compare_exchange(expected as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// How a preload run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    Completed { pulled: usize, failed: usize },
    Cancelled,
}

/// Drives the `Unknown -> InProgress -> Preloaded` lifecycle
pub struct PreloadCoordinator {
    backend: Arc<dyn ModelBackend>,
    models: Vec<String>,
    status: Arc<PreloadStatus>,
    probe_interval: Duration,
}

impl PreloadCoordinator {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        models: Vec<String>,
        status: Arc<PreloadStatus>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            backend,
            models,
            status,
            probe_interval,
        }
    }

    /// Run to completion or until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> PreloadOutcome {
        if !self.wait_for_upstream(&cancel).await {
            tracing::info!("Preload cancelled while waiting for upstream");
            return PreloadOutcome::Cancelled;
        }

        self.status.advance(PreloadState::InProgress);
        tracing::info!(models = ?self.models, "Preloading models");

        let mut pulled = 0;
        let mut failed = 0;
        for model in &self.models {
            let mut progress = PullProgress::default();
            let mut on_progress = |record: &ProgressResponse| {
                if let Some(percent) = progress.update(record) {
                    tracing::info!(model = %model, status = %record.status, percent, "Pulling model");
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(model = %model, "Preload cancelled during pull");
                    return PreloadOutcome::Cancelled;
                }
                result = self.backend.pull(model, &mut on_progress) => result,
            };

            match result {
                Ok(()) => {
                    tracing::info!(model = %model, "Model preloaded");
                    pulled += 1;
                }
                Err(e) => {
                    tracing::error!(model = %model, error = %e, "Failed to preload model");
                    failed += 1;
                }
            }
        }

        self.status.advance(PreloadState::Preloaded);
        tracing::info!(pulled, failed, "Model preload finished");

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.log_available_models() => {}
        }

        PreloadOutcome::Completed { pulled, failed }
    }

    /// Probe until the upstream answers; false when cancelled first
    async fn wait_for_upstream(&self, cancel: &CancellationToken) -> bool {
        loop {
            let running = tokio::select! {
                _ = cancel.cancelled() => return false,
                running = self.backend.is_running() => running,
            };
            if running {
                return true;
            }

            tracing::info!("Waiting for upstream to be running...");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.probe_interval) => {}
            }
        }
    }

    async fn log_available_models(&self) {
        match self.backend.list().await {
            Ok(list) => {
                let mut total = 0u64;
                for model in &list.models {
                    tracing::info!(model = %model.name, size_gb = %format_gb(model.size), "Available model");
                    total = total.saturating_add(model.size);
                }
                tracing::info!(
                    count = list.models.len(),
                    total_gb = %format_gb(total),
                    "Total size of available models"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list models");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ListModel, ListResponse};
    use crate::upstream::BackendError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    /// Scripted backend recording the preload state at every call
    struct FakeBackend {
        status: Arc<PreloadStatus>,
        up_after_probes: usize,
        probes: AtomicUsize,
        probe_states: Mutex<Vec<PreloadState>>,
        pulls: Mutex<Vec<(String, PreloadState)>>,
        failing: Vec<String>,
        hang_pulls: bool,
        listed: AtomicBool,
    }

    impl FakeBackend {
        fn new(status: Arc<PreloadStatus>) -> Self {
            Self {
                status,
                up_after_probes: 0,
                probes: AtomicUsize::new(0),
                probe_states: Mutex::new(Vec::new()),
                pulls: Mutex::new(Vec::new()),
                failing: Vec::new(),
                hang_pulls: false,
                listed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ModelBackend for FakeBackend {
        async fn is_running(&self) -> bool {
            self.probe_states.lock().unwrap().push(self.status.get());
            let seen = self.probes.fetch_add(1, Ordering::SeqCst);
            seen >= self.up_after_probes
        }

        async fn pull(
            &self,
            model: &str,
            progress: &mut (dyn for<'r> FnMut(&'r ProgressResponse) + Send),
        ) -> Result<(), BackendError> {
            self.pulls.lock().unwrap().push((model.to_string(), self.status.get()));
            if self.hang_pulls {
                std::future::pending::<()>().await;
            }
            progress(&ProgressResponse {
                status: "pulling".to_string(),
                total: Some(10),
                completed: Some(5),
                ..Default::default()
            });
            if self.failing.iter().any(|m| m == model) {
                return Err(BackendError::Remote("file does not exist".to_string()));
            }
            Ok(())
        }

        async fn list(&self) -> Result<ListResponse, BackendError> {
            self.listed.store(true, Ordering::SeqCst);
            Ok(ListResponse {
                models: vec![ListModel {
                    name: "a:latest".to_string(),
                    size: 1024,
                    ..Default::default()
                }],
            })
        }
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_status_transitions_forward_only() {
        let status = PreloadStatus::new();
        assert_eq!(status.get(), PreloadState::Unknown);

        assert!(!status.advance(PreloadState::Preloaded));
        assert!(!status.advance(PreloadState::Unknown));
        assert!(status.advance(PreloadState::InProgress));
        assert!(!status.advance(PreloadState::InProgress));
        assert_eq!(status.get(), PreloadState::InProgress);

        assert!(status.advance(PreloadState::Preloaded));
        assert!(!status.advance(PreloadState::Preloaded));
        assert!(!status.advance(PreloadState::InProgress));
        assert_eq!(status.get(), PreloadState::Preloaded);
    }

    #[tokio::test]
    async fn test_failed_pull_does_not_stop_preload() {
        let status = Arc::new(PreloadStatus::new());
        let backend = Arc::new(FakeBackend {
            up_after_probes: 2,
            failing: models(&["b"]),
            ..FakeBackend::new(status.clone())
        });
        let coordinator = PreloadCoordinator::new(
            backend.clone(),
            models(&["a", "b", "c"]),
            status.clone(),
            Duration::from_millis(1),
        );

        let outcome = coordinator.run(CancellationToken::new()).await;

        assert_eq!(outcome, PreloadOutcome::Completed { pulled: 2, failed: 1 });
        assert_eq!(status.get(), PreloadState::Preloaded);
        assert_eq!(
            *backend.probe_states.lock().unwrap(),
            vec![PreloadState::Unknown; 3]
        );
        assert_eq!(
            *backend.pulls.lock().unwrap(),
            vec![
                ("a".to_string(), PreloadState::InProgress),
                ("b".to_string(), PreloadState::InProgress),
                ("c".to_string(), PreloadState::InProgress),
            ]
        );
        assert!(backend.listed.load(Ordering::SeqCst));
    }

    /// Collects formatted log output for assertions
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_progress_log_carries_pull_status() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let status = Arc::new(PreloadStatus::new());
        let backend = Arc::new(FakeBackend::new(status.clone()));
        let coordinator = PreloadCoordinator::new(backend, models(&["a"]), status, Duration::from_millis(1));
        coordinator.run(CancellationToken::new()).await;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output.lines().find(|l| l.contains("Pulling model")).unwrap();
        assert!(line.contains("model=a"), "{line}");
        assert!(line.contains("status=pulling"), "{line}");
        assert!(line.contains("percent=50"), "{line}");
    }

    #[tokio::test]
    async fn test_no_models_still_reaches_preloaded() {
        let status = Arc::new(PreloadStatus::new());
        let backend = Arc::new(FakeBackend::new(status.clone()));
        let coordinator = PreloadCoordinator::new(backend.clone(), Vec::new(), status.clone(), Duration::from_millis(1));

        let outcome = coordinator.run(CancellationToken::new()).await;

        assert_eq!(outcome, PreloadOutcome::Completed { pulled: 0, failed: 0 });
        assert_eq!(status.get(), PreloadState::Preloaded);
        assert!(backend.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_upstream() {
        let status = Arc::new(PreloadStatus::new());
        let backend = Arc::new(FakeBackend {
            up_after_probes: usize::MAX,
            ..FakeBackend::new(status.clone())
        });
        let coordinator =
            PreloadCoordinator::new(backend.clone(), models(&["a"]), status.clone(), Duration::from_millis(5));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(coordinator.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), PreloadOutcome::Cancelled);
        assert_eq!(status.get(), PreloadState::Unknown);
        assert!(backend.probes.load(Ordering::SeqCst) >= 1);
        assert!(backend.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_pull() {
        let status = Arc::new(PreloadStatus::new());
        let backend = Arc::new(FakeBackend {
            hang_pulls: true,
            ..FakeBackend::new(status.clone())
        });
        let coordinator =
            PreloadCoordinator::new(backend.clone(), models(&["a", "b"]), status.clone(), Duration::from_millis(1));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(coordinator.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap(),
            PreloadOutcome::Cancelled
        );
        assert_eq!(status.get(), PreloadState::InProgress);
        assert_eq!(backend.pulls.lock().unwrap().len(), 1);
        assert!(!backend.listed.load(Ordering::SeqCst));
    }
}
