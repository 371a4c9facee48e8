//! Main proxy server implementation

use axum::{
    extract::State,
    middleware,
    routing::{any, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::context::IdentityHeaders;
use super::handler::ProxyHandler;
use super::ping::{ping_handler, ProbeClock};
use super::ServerError;
use crate::auth::{require_api_key, AuthGate};
use crate::config::AppConfig;
use crate::exporters::MetricsForwarder;
use crate::preload::PreloadStatus;
use crate::upstream::{build_http_client, ModelBackend};

/// Shared state for the proxy
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<AppConfig>,
    pub http_client: reqwest::Client,
    pub identity: Arc<IdentityHeaders>,
    pub backend: Arc<dyn ModelBackend>,
    pub preload: Arc<PreloadStatus>,
    pub probe_clock: Arc<ProbeClock>,
    pub metrics: MetricsForwarder,
}

impl ProxyState {
    pub fn new(
        config: Arc<AppConfig>,
        backend: Arc<dyn ModelBackend>,
        preload: Arc<PreloadStatus>,
        metrics: MetricsForwarder,
    ) -> Result<Self, ServerError> {
        let timeout = config.upstream.timeout_seconds.map(std::time::Duration::from_secs);
        let http_client = build_http_client(&config.upstream, timeout)?;
        let identity = IdentityHeaders::from_config(&config.auth)?;

        Ok(Self {
            config,
            http_client,
            identity: Arc::new(identity),
            backend,
            preload,
            probe_clock: Arc::new(ProbeClock::new()),
            metrics,
        })
    }
}

/// Router for the main listener: every request is authorized, then either
/// answered locally (auth check, ping) or proxied upstream.
pub fn build_router(state: ProxyState, gate: Arc<AuthGate>) -> Router {
    let mut router = Router::new();

    if let Some(ref auth_path) = state.config.server.auth_path {
        router = router.route(auth_path, any(auth_check_handler));
    }
    if !state.config.ping.has_own_listener() {
        router = router.route(&state.config.ping.path, get(ping_handler));
    }

    router
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(gate, require_api_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the dedicated ping listener
pub fn build_ping_router(state: ProxyState, gate: Arc<AuthGate>) -> Router {
    Router::new()
        .route(&state.config.ping.path, get(ping_handler))
        .layer(middleware::from_fn_with_state(gate, require_api_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the proxy (and ping) listeners until `cancel` fires
///
/// After cancellation in-flight requests get `server.shutdown_grace_seconds`
/// to finish before the listeners are torn down.
pub async fn run_server(state: ProxyState, cancel: CancellationToken) -> Result<(), ServerError> {
    let config = state.config.clone();
    let gate = Arc::new(AuthGate::new(&config.auth.api_keys));

    let addr = config.listen_addr()?;
    let listener = bind(addr).await?;

    tracing::info!("ollama-auth-proxy listening on {}", addr);
    tracing::info!("Proxying to {}", config.upstream.base_url());
    if gate.is_enabled() {
        tracing::info!(keys = gate.key_count(), "Authorization enabled");
    } else {
        tracing::warn!("No API keys configured, authorization is disabled");
    }

    let mut servers = JoinSet::new();
    servers.spawn(serve("proxy", listener, build_router(state.clone(), gate.clone()), cancel.clone()));

    if let Some(ping_addr) = config.ping_addr()? {
        let ping_listener = bind(ping_addr).await?;
        tracing::info!("Ping listening on {}{}", ping_addr, config.ping.path);
        servers.spawn(serve("ping", ping_listener, build_ping_router(state, gate), cancel.clone()));
    }

    let mut result = Ok(());
    tokio::select! {
        _ = cancel.cancelled() => {}
        Some(joined) = servers.join_next() => {
            // One listener died on its own; bring the other down with it
            cancel.cancel();
            result = flatten(joined);
        }
    }

    let grace = config.server.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = servers.join_next().await {
            if let Err(e) = flatten(joined) {
                tracing::error!(error = %e, "Listener failed during shutdown");
            }
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(grace_seconds = grace.as_secs(), "Grace period elapsed, dropping in-flight requests");
        servers.abort_all();
    }

    result
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    tracing::info!(listener = name, "Listener stopped");
    Ok(())
}

fn flatten(joined: Result<Result<(), ServerError>, tokio::task::JoinError>) -> Result<(), ServerError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ServerError::Io(std::io::Error::other(e))),
    }
}

/// Answers 200 once the auth middleware has let the request through
async fn auth_check_handler() -> &'static str {
    "OK"
}

/// Main proxy handler
async fn proxy_handler(State(state): State<ProxyState>, req: axum::extract::Request) -> axum::response::Response {
    let handler = ProxyHandler::new(state);
    handler.handle(req).await
}
