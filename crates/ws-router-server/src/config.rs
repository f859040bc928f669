use serde::Deserialize;
use std::path::Path;
use tracing::warn;
use ws_router::WsOptions;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub websocket: WsOptions,
    /// Extra allowed `Origin` globs for upgrades. Localhost is always allowed.
    #[serde(default)]
    pub origin_allowlist: Vec<String>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared token required on every route except `/health`. Unset
    /// disables authentication.
    #[serde(default)]
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file yields the default configuration with a warning.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}
