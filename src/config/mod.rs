mod loader;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub use loader::{apply_env_overrides, load_config, upstream_url_from_host};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub preload: PreloadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Main listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path answering 200 after a successful auth check (nginx `auth_request`)
    #[serde(default)]
    pub auth_path: Option<String>,
    /// How long in-flight requests may run after shutdown is requested
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18434
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_path: None,
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Ping endpoint configuration
///
/// When `port` is set the ping endpoint gets its own listener and is no longer
/// served on the main one.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PingConfig {
    #[serde(default = "default_ping_path")]
    pub path: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_ping_path() -> String {
    "/ping".to_string()
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            path: default_ping_path(),
            host: None,
            port: None,
        }
    }
}

impl PingConfig {
    pub fn has_own_listener(&self) -> bool {
        self.port.is_some()
    }
}

/// Inbound authorization and caller identity
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Accepted bearer keys; empty disables authorization
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Header carrying the caller's user id; unset matches any `*-user-id` header
    #[serde(default)]
    pub user_id_header: Option<String>,
    /// Header carrying the caller's user name; unset matches any `*-user-name` header
    #[serde(default)]
    pub user_name_header: Option<String>,
}

/// Upstream Ollama configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Full upstream URL (e.g. "http://localhost:11434")
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Overall timeout for proxied requests; unset means none
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Timeout for liveness probes
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// TLS configuration options
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS configuration for upstream connections
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Accept invalid certificates (self-signed, expired)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Path to custom CA certificate (PEM format)
    pub ca_cert_path: Option<String>,
    /// Path to client certificate for mTLS
    pub client_cert_path: Option<String>,
    /// Path to client private key for mTLS
    pub client_key_path: Option<String>,
}

fn default_upstream_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_seconds: None,
            probe_timeout_seconds: default_probe_timeout(),
            tls: None,
        }
    }
}

impl UpstreamConfig {
    /// Returns the base URL with trailing slash stripped
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Returns true if the URL uses HTTPS
    pub fn is_tls(&self) -> bool {
        self.url.to_lowercase().starts_with("https://")
    }
}

/// Model preload configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreloadConfig {
    /// Models pulled in order once the upstream is up
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
}

fn default_probe_interval() -> u64 {
    2
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            probe_interval_seconds: default_probe_interval(),
        }
    }
}

impl PreloadConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }
}

/// Usage metrics webhook configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Webhook receiving one JSON document per completed request; unset disables forwarding
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Sent as `Authorization: Bearer <key>` when set
    #[serde(default)]
    pub webhook_api_key: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_webhook_timeout() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_api_key: None,
            queue_capacity: default_queue_capacity(),
            timeout_seconds: default_webhook_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON log lines instead of text
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_config(path)
    }

    /// Load configuration from an explicit path, the first default path that
    /// exists, or built-in defaults
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::from_file(path),
            None => {
                let default_paths = ["config.yaml", "config.yml", "./config/config.yaml"];
                for p in default_paths {
                    let path = Path::new(p);
                    if path.exists() {
                        return Self::from_file(path);
                    }
                }
                Ok(Self::default())
            }
        }
    }

    /// Full startup load: file (or defaults), the process environment,
    /// `overrides` (command-line flags), then validation
    pub fn load<F>(config_path: Option<&Path>, overrides: F) -> Result<Self, ConfigError>
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::load_or_default(config_path)?;
        apply_env_overrides(&mut config, std::env::vars())?;
        overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Check everything that must hold before the proxy can start
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upstream = url::Url::parse(&self.upstream.url)
            .map_err(|e| ConfigError::Validation(format!("invalid upstream url '{}': {}", self.upstream.url, e)))?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "upstream url must be http or https, got '{}'",
                upstream.scheme()
            )));
        }

        if let Some(ref webhook) = self.metrics.webhook_url {
            url::Url::parse(webhook)
                .map_err(|e| ConfigError::Validation(format!("invalid metrics webhook url '{}': {}", webhook, e)))?;
        }
        if self.metrics.queue_capacity == 0 {
            return Err(ConfigError::Validation("metrics.queue_capacity must be at least 1".to_string()));
        }

        if !self.ping.path.starts_with('/') {
            return Err(ConfigError::Validation(format!("ping path must start with '/', got '{}'", self.ping.path)));
        }
        if let Some(ref auth_path) = self.server.auth_path {
            if !auth_path.starts_with('/') {
                return Err(ConfigError::Validation(format!("auth path must start with '/', got '{}'", auth_path)));
            }
            if !self.ping.has_own_listener() && *auth_path == self.ping.path {
                return Err(ConfigError::Validation(format!("auth path '{}' collides with the ping path", auth_path)));
            }
        }

        let main_addr = self.listen_addr()?;
        if let Some(ping_addr) = self.ping_addr()? {
            if ping_addr == main_addr {
                return Err(ConfigError::Validation(format!(
                    "ping listener {} must differ from the main listener",
                    ping_addr
                )));
            }
        }

        Ok(())
    }

    /// Socket address of the main listener
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.server.host, self.server.port)
    }

    /// Socket address of the dedicated ping listener, if configured
    pub fn ping_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        match self.ping.port {
            Some(port) => {
                let host = self.ping.host.as_deref().unwrap_or(&self.server.host);
                parse_addr(host, port).map(Some)
            }
            None => Ok(None),
        }
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|e| ConfigError::Validation(format!("invalid listen host '{}': {}", host, e)))?;
    Ok(SocketAddr::new(ip, port))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
