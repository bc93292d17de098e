//! Configuration management for Tollgate.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Prefix for environment overrides, e.g. `TOLLGATE__LIMITS__QUOTA=20`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Rate limit policy
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Middleware adapter behaviour
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limit policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests admitted per window
    #[serde(default = "default_quota")]
    pub quota: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Total per-window ceiling; defaults to `quota` when unset or zero
    #[serde(default)]
    pub burst: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            quota: default_quota(),
            window_ms: default_window_ms(),
            burst: None,
        }
    }
}

fn default_quota() -> u64 {
    10
}

fn default_window_ms() -> u64 {
    10_000
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace prepended to every identifier
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Deadline for establishing the connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

pub(crate) fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

/// What the adapter does when the counter store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Deny the request (store outages cannot bypass limits)
    #[default]
    Closed,
    /// Let the request through and log the failure
    Open,
}

/// Middleware adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Read the client address from `X-Real-IP` / `X-Forwarded-For`
    #[serde(default = "default_trust_forwarded")]
    pub trust_forwarded_headers: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            trust_forwarded_headers: default_trust_forwarded(),
        }
    }
}

fn default_trust_forwarded() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
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
    /// Load configuration from a YAML file, with `TOLLGATE__*` environment
    /// variables layered on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TollgateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work at request time.
    ///
    /// Policy-level checks (window length, burst below quota) live in
    /// `RatePolicy::new`; this covers the store and adapter settings.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(TollgateError::Config("store.url cannot be empty".into()));
        }
        if self.store.timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.timeout_ms must be greater than 0".into(),
            ));
        }
        if self.store.connect_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        crate::ratelimit::RatePolicy::from_config(&self.limits)?;
        Ok(())
    }
}
