//! ollama-auth-proxy: authenticating streaming reverse proxy for Ollama
//!
//! Sits in front of an Ollama server and provides:
//! - Bearer API-key authorization
//! - Per-user usage metrics delivered to a webhook
//! - Model preload and a readiness ping

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

use ollama_auth_proxy::{
    config::{upstream_url_from_host, AppConfig, LoggingConfig},
    exporters::{MetricsForwarder, WebhookExporter},
    preload::{format_gb, PreloadCoordinator, PreloadStatus},
    proxy::{run_server, ProxyState},
    upstream::{ModelBackend, OllamaClient},
};

#[derive(Parser)]
#[command(name = "ollama-auth-proxy")]
#[command(version = "0.1.0")]
#[command(about = "Authenticating streaming reverse proxy for Ollama")]
#[command(long_about = "
ollama-auth-proxy sits in front of an Ollama server and provides:
  - Bearer API-key authorization on every route
  - Per-user usage metrics posted to a webhook
  - Model preload on startup and a readiness ping

Configuration comes from a YAML file and AUTHORIZATION_* / OLLAMA_HOST
environment variables.

Example usage:
  ollama-auth-proxy run --config config.yaml
  AUTHORIZATION_APIKEY=secret OLLAMA_HOST=ollama:11434 ollama-auth-proxy run
")]
struct Cli {
    /// Path to config file (default: config.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Set logging level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Run {
        /// Override listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Override upstream URL (e.g., "http://ollama:11434" or "ollama:11434")
        #[arg(long)]
        upstream_url: Option<String>,
    },

    /// Validate configuration
    CheckConfig,

    /// Test connection to the upstream Ollama server
    TestUpstream,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (port, upstream_url) = match &cli.command {
        Commands::Run { port, upstream_url } => (*port, upstream_url.clone()),
        _ => (None, None),
    };
    let config = load_config_or_exit(cli.config.as_deref(), port, upstream_url);

    init_tracing(cli.log_level, &config.logging);

    match cli.command {
        Commands::Run { .. } => {
            run_proxy(config).await?;
        }
        Commands::CheckConfig => {
            check_config(&config);
        }
        Commands::TestUpstream => {
            test_upstream(&config).await?;
        }
    }

    Ok(())
}

/// `--log-level` wins over `RUST_LOG`, which wins over the config file
fn init_tracing(cli_level: Option<LogLevel>, logging: &LoggingConfig) {
    let filter = match cli_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level.to_string()),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level)),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the proxy until SIGINT/SIGTERM
async fn run_proxy(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let backend: Arc<dyn ModelBackend> = Arc::new(OllamaClient::from_config(&config.upstream)?);

    // Preload runs in the background; requests are served meanwhile
    let preload = Arc::new(PreloadStatus::new());
    let coordinator = PreloadCoordinator::new(
        backend.clone(),
        config.preload.models.clone(),
        preload.clone(),
        config.preload.probe_interval(),
    );
    let preload_task = tokio::spawn(coordinator.run(cancel.clone()));

    let (metrics, metrics_worker) = match WebhookExporter::from_config(&config.metrics)? {
        Some(exporter) => {
            tracing::info!(url = %exporter.url(), "Metrics webhook enabled");
            let (forwarder, worker) = MetricsForwarder::spawn(Arc::new(exporter), config.metrics.queue_capacity);
            (forwarder, Some(worker))
        }
        None => {
            tracing::info!("No metrics webhook configured, usage events are only logged");
            (MetricsForwarder::disabled(), None)
        }
    };

    let state = ProxyState::new(config.clone(), backend, preload, metrics)?;
    let result = run_server(state, cancel.clone()).await;

    // The server may also have stopped on its own
    cancel.cancel();

    // Dropping the last forwarder clone lets the worker finish the queue and exit

    let grace = config.server.shutdown_grace();
    if let Some(worker) = metrics_worker {
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!("Metrics forwarder did not drain within the grace period");
        }
    }
    if tokio::time::timeout(grace, preload_task).await.is_err() {
        tracing::warn!("Preload did not stop within the grace period");
    }

    tracing::info!("Shutdown complete");
    Ok(result?)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let reason = shutdown_signal().await;
        tracing::info!(signal = reason, "Shutting down");
        cancel.cancel();
    });
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Print the effective configuration
fn check_config(config: &AppConfig) {
    println!("✓ Configuration is valid\n");
    println!("Server:");
    println!("  Listen: {}:{}", config.server.host, config.server.port);
    if let Some(ref auth_path) = config.server.auth_path {
        println!("  Auth check path: {}", auth_path);
    }
    println!("  Shutdown grace: {}s", config.server.shutdown_grace_seconds);
    println!("\nPing:");
    match config.ping.port {
        Some(port) => println!(
            "  Listen: {}:{}{}",
            config.ping.host.as_deref().unwrap_or(&config.server.host),
            port,
            config.ping.path
        ),
        None => println!("  Path: {} (main listener)", config.ping.path),
    }
    println!("\nAuth:");
    println!("  API keys: {}", config.auth.api_keys.iter().filter(|k| !k.trim().is_empty()).count());
    if let Some(ref header) = config.auth.user_id_header {
        println!("  User id header: {}", header);
    }
    if let Some(ref header) = config.auth.user_name_header {
        println!("  User name header: {}", header);
    }
    println!("\nUpstream:");
    println!("  URL: {}", config.upstream.url);
    println!("  TLS: {}", if config.upstream.is_tls() { "enabled" } else { "disabled" });
    if let Some(ref tls) = config.upstream.tls {
        if tls.accept_invalid_certs {
            println!("  TLS: Accepting invalid certificates");
        }
        if let Some(ref ca) = tls.ca_cert_path {
            println!("  TLS CA: {}", ca);
        }
        if let Some(ref cert) = tls.client_cert_path {
            println!("  TLS Client Cert: {}", cert);
        }
    }
    match config.upstream.timeout_seconds {
        Some(timeout) => println!("  Timeout: {}s", timeout),
        None => println!("  Timeout: none"),
    }
    println!("\nPreload:");
    println!("  Models: {}", if config.preload.models.is_empty() { "-".to_string() } else { config.preload.models.join(", ") });
    println!("\nMetrics:");
    println!("  Webhook: {}", config.metrics.webhook_url.as_deref().unwrap_or("disabled"));
    println!("  Queue capacity: {}", config.metrics.queue_capacity);
    println!("\nLogging:");
    println!("  Level: {}", config.logging.level);
    println!("  JSON: {}", config.logging.json);
}

/// Check the upstream is reachable and list its models
async fn test_upstream(config: &AppConfig) -> anyhow::Result<()> {
    let client = OllamaClient::from_config(&config.upstream).context("failed to build upstream client")?;

    println!("Testing connection to upstream: {}", client.base_url());

    if !client.is_running().await {
        println!("✗ Upstream is not reachable");
        std::process::exit(1);
    }
    println!("✓ Upstream is running");

    let list = client
        .list()
        .await
        .with_context(|| format!("failed to list models at {}/api/tags", client.base_url()))?;

    println!("  Available models: {}", list.models.len());
    for model in &list.models {
        println!("    - {} ({} GB)", model.name, format_gb(model.size));
    }

    for wanted in &config.preload.models {
        let present = list
            .models
            .iter()
            .any(|m| m.name == *wanted || m.name == format!("{}:latest", wanted));
        if !present {
            println!("  ! Preload model not present yet: {}", wanted);
        }
    }

    Ok(())
}

/// Load configuration or exit with error
fn load_config_or_exit(config_path: Option<&Path>, port: Option<u16>, upstream_url: Option<String>) -> AppConfig {
    let result = AppConfig::load(config_path, |config| {
        if let Some(port) = port {
            config.server.port = port;
        }
        if let Some(url) = upstream_url {
            config.upstream.url = upstream_url_from_host(&url);
        }
    });

    match result {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            eprintln!("\nSettings come from a YAML file (--config) and environment variables.");
            eprintln!("You can copy config.yaml.default and modify it:");
            eprintln!("  cp config.yaml.default config.yaml");
            std::process::exit(1);
        }
    }
}
