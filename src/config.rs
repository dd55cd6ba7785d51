//! Configuration for the JWKS cache.
//!
//! Loadable from environment variables (the deployment path) or built as
//! struct literals by embedding services and tests.
//!
//! ## Environment Variables
//! - `JWKS_URLS` (required): comma-separated JWKS endpoint URLs
//! - `JWKS_MIN_REFRESH_SECS` (optional): refresh floor, default 900 (15 minutes)
//! - `JWKS_FETCH_TIMEOUT_SECS` (optional): per-fetch timeout, default 10
//! - `JWKS_POLL_INTERVAL_SECS` (optional): background poll granularity, default 30

use std::time::Duration;

use thiserror::Error;

/// Minimum time between fetches of one source, regardless of any
/// server-advertised TTL.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Per-fetch network timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the background loop checks whether sources are due.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// One configured JWKS endpoint.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// URL of the key-set document.
    pub url: String,

    /// Floor on how often this source may be fetched.
    pub min_refresh_interval: Duration,
}

impl SourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }
}

/// Full cache configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub sources: Vec<SourceConfig>,
    pub fetch_timeout: Duration,
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let urls = std::env::var("JWKS_URLS")
            .map_err(|_| ConfigError::MissingEnvVar("JWKS_URLS".to_string()))?;

        let min_refresh_interval =
            duration_from_env("JWKS_MIN_REFRESH_SECS", DEFAULT_MIN_REFRESH_INTERVAL)?;
        let fetch_timeout = duration_from_env("JWKS_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT)?;
        let poll_interval = duration_from_env("JWKS_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL)?;

        let sources: Vec<SourceConfig> = urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| SourceConfig::new(url).with_min_refresh_interval(min_refresh_interval))
            .collect();

        if sources.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "JWKS_URLS".to_string(),
                value: urls,
            });
        }

        Ok(Self {
            sources,
            fetch_timeout,
            poll_interval,
        })
    }
}

fn duration_from_env(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(value) => {
            let secs = value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            })?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}
