//! Configuration loading and types for aztables.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The `client` section describes how to reach a Table
//! endpoint; the `emulator` section drives the bundled in-memory service.

use serde::Deserialize;
use std::path::Path;

use crate::auth::{DEV_ACCOUNT_KEY, DEV_ACCOUNT_NAME};

/// Root of the YAML document. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Table service client settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// In-memory emulator settings.
    #[serde(default)]
    pub emulator: EmulatorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus export for the emulator.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// How a [`crate::client::TableServiceClient`] reaches its service.
///
/// Either `connection_string` or `endpoint` must be set.  With `endpoint`,
/// authentication is `account` + `account_key` (Shared Key) or `sas_token`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Service root, e.g. `https://acct.table.core.windows.net`.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub account: Option<String>,

    /// Base64 account key.
    #[serde(default)]
    pub account_key: Option<String>,

    /// Storage connection string; takes precedence over the fields above.
    #[serde(default)]
    pub connection_string: Option<String>,

    #[serde(default)]
    pub sas_token: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            account: None,
            account_key: None,
            connection_string: None,
            sas_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Emulator listener and behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct EmulatorConfig {
    /// Listener address; `--bind` overrides host and port together.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Account name used for Shared Key verification.
    #[serde(default = "default_account")]
    pub account: String,

    /// Base64 account key used for Shared Key verification.
    #[serde(default = "default_account_key")]
    pub account_key: String,

    /// Reject requests without a valid `Authorization: SharedKey` header.
    #[serde(default)]
    pub require_auth: bool,

    /// Largest accepted `$batch` changeset.
    #[serde(default = "default_max_batch_operations")]
    pub max_batch_operations: usize,

    /// Seconds in-flight requests get after SIGTERM/SIGINT.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            account: default_account(),
            account_key: default_account_key(),
            require_auth: false,
            max_batch_operations: default_max_batch_operations(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Subscriber setup for the emulator binary. `RUST_LOG` overrides `level`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `aztables=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics switch.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder and serve `/metrics`.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10002
}

fn default_account() -> String {
    DEV_ACCOUNT_NAME.to_string()
}

fn default_account_key() -> String {
    DEV_ACCOUNT_KEY.to_string()
}

fn default_max_batch_operations() -> usize {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
