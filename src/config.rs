//! Configuration management for Tollgate.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TOLLGATE__`-prefixed environment variables
//! (`TOLLGATE__SERVER__HTTP_ADDR=0.0.0.0:8080`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::policy::{PolicyCatalog, PolicyConfig, GENERAL};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Take the caller address from `X-Forwarded-For`
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_proxy: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which window store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Idle windows are dropped after this many seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Seconds between retention sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound for one store operation, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            retention_secs: default_retention(),
            sweep_interval_secs: default_sweep_interval(),
            operation_timeout_ms: default_operation_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

fn default_retention() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_operation_timeout() -> u64 {
    250
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policy overrides and additions, keyed by policy name
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,

    /// Policy guarding routes that do not name one
    #[serde(default = "default_policy")]
    pub default_policy: String,

    /// Rows of recent activity returned by the stats endpoint
    #[serde(default = "default_stats_recent_limit")]
    pub stats_recent_limit: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policies: HashMap::new(),
            default_policy: default_policy(),
            stats_recent_limit: default_stats_recent_limit(),
        }
    }
}

fn default_policy() -> String {
    GENERAL.to_string()
}

fn default_stats_recent_limit() -> usize {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<TollgateConfig>())
            .map_err(|e| TollgateError::Config(e.to_string()))?
            .validated()
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validated()
    }

    /// Build the policy catalog this configuration describes.
    pub fn policy_catalog(&self) -> Result<PolicyCatalog> {
        PolicyCatalog::with_overrides(&self.rate_limiting.policies)
    }

    fn validated(self) -> Result<Self> {
        let catalog = self.policy_catalog()?;
        catalog.require(&self.rate_limiting.default_policy)?;

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(TollgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "store.sweep_interval_secs must be positive".to_string(),
            ));
        }

        Ok(self)
    }
}
