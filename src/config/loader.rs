use std::path::Path;

use super::{AppConfig, ConfigError};

/// Prefix shared by every API key variable (`AUTHORIZATION_APIKEY`, `AUTHORIZATION_APIKEY_TEAM_A`, ...)
const API_KEY_PREFIX: &str = "AUTHORIZATION_APIKEY";

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }

    let content = std::fs::read_to_string(path)?;
    // An empty file deserializes to `null`, which is not a mapping
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    let config: AppConfig = serde_yaml::from_str(&content)?;

    Ok(config)
}

/// Overlay environment variables on top of a loaded configuration
///
/// Takes the variables as an iterator so callers (and tests) decide where they
/// come from. API keys are appended in variable-name order.
pub fn apply_env_overrides<I>(config: &mut AppConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars: Vec<(String, String)> = vars.into_iter().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, value) in vars {
        match name.as_str() {
            "AUTHORIZATION_HOST" => config.server.host = value,
            "AUTHORIZATION_PORT" => {
                if let Some(port) = parse_port(&name, &value)? {
                    config.server.port = port;
                }
            }
            "AUTHORIZATION_PATH" => config.server.auth_path = non_empty(value),
            "AUTHORIZATION_PING_HOST" => config.ping.host = non_empty(value),
            "AUTHORIZATION_PING_PORT" => {
                if let Some(port) = parse_port(&name, &value)? {
                    config.ping.port = Some(port);
                }
            }
            "OLLAMA_HOST" => config.upstream.url = upstream_url_from_host(&value),
            "AUTHORIZATION_PRELOAD_MODELS" => {
                config.preload.models = value
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "AUTHORIZATION_METRICS_WEBHOOK_URL" => config.metrics.webhook_url = non_empty(value),
            "AUTHORIZATION_METRICS_WEBHOOK_APIKEY" => config.metrics.webhook_api_key = non_empty(value),
            "AUTHORIZATION_LOG_LEVEL" => config.logging.level = value.trim().to_lowercase(),
            "AUTHORIZATION_LOG_JSON" => config.logging.json = parse_bool(&name, &value)?,
            _ if name.starts_with(API_KEY_PREFIX) => {
                let key = value.trim();
                if !key.is_empty() {
                    config.auth.api_keys.push(key.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// `OLLAMA_HOST` is usually `host:port`; a value with a scheme is taken as-is
pub fn upstream_url_from_host(value: &str) -> String {
    let value = value.trim();
    if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{}", value)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `0` means "not set": the configured port is kept
fn parse_port(name: &str, value: &str) -> Result<Option<u16>, ConfigError> {
    let port: u16 = value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Validation(format!("{} must be a port number, got '{}': {}", name, value, e)))?;
    if port == 0 {
        tracing::debug!(variable = name, "Ignoring port 0, keeping the configured port");
        return Ok(None);
    }
    Ok(Some(port))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::Validation(format!("{} must be a boolean, got '{}'", name, other))),
    }
}
