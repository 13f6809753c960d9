//! Remote store configuration.
//!
//! Configuration is read from environment variables (`ANNOLINK_STORE_*`)
//! or built directly. A missing credential or base URL is reported by
//! [`StoreConfig::validate`] before any network call is made.
//!
//! # Example
//!
//! ```rust,no_run
//! use annolink_store::config::StoreConfig;
//!
//! let config = StoreConfig::from_env();
//! config.validate().expect("store configuration incomplete");
//! ```

use annolink_core::defaults;
use annolink_core::IdCanonicalizer;
use std::env;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for annolink_core::Error {
    fn from(e: ConfigError) -> Self {
        annolink_core::Error::Config(e.to_string())
    }
}

/// Connection settings for the annotation repository.
#[derive(Clone)]
pub struct StoreConfig {
    /// Base URL, e.g. `https://annorepo.example.org/w3c`.
    pub base_url: String,
    /// Container holding the annotations.
    pub container: String,
    /// Bearer credential sent on every request.
    pub token: Option<String>,
    /// Timeout for reads and writes in seconds.
    pub timeout_seconds: u64,
    /// Timeout for HEAD existence checks in seconds.
    pub exists_timeout_seconds: u64,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("base_url", &self.base_url)
            .field("container", &self.container)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_seconds", &self.timeout_seconds)
            .field("exists_timeout_seconds", &self.exists_timeout_seconds)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            container: defaults::STORE_CONTAINER.to_string(),
            token: None,
            timeout_seconds: defaults::STORE_TIMEOUT_SECS,
            exists_timeout_seconds: defaults::EXISTS_TIMEOUT_SECS,
        }
    }
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            container: container.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ANNOLINK_STORE_URL` | (none) | Repository base URL |
    /// | `ANNOLINK_STORE_CONTAINER` | `necessaryreunions` | Container name |
    /// | `ANNOLINK_STORE_TOKEN` | (none) | Bearer credential |
    /// | `ANNOLINK_STORE_TIMEOUT_SECS` | `30` | Read/write timeout |
    /// | `ANNOLINK_EXISTS_TIMEOUT_SECS` | `10` | HEAD existence timeout |
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("ANNOLINK_STORE_URL").unwrap_or_default(),
            container: env::var("ANNOLINK_STORE_CONTAINER")
                .unwrap_or_else(|_| defaults::STORE_CONTAINER.to_string()),
            token: env::var("ANNOLINK_STORE_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            timeout_seconds: env::var("ANNOLINK_STORE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::STORE_TIMEOUT_SECS),
            exists_timeout_seconds: env::var("ANNOLINK_EXISTS_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::EXISTS_TIMEOUT_SECS),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_exists_timeout(mut self, seconds: u64) -> Self {
        self.exists_timeout_seconds = seconds;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Missing(
                "store base URL (ANNOLINK_STORE_URL)".to_string(),
            ));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "store base URL must start with http:// or https://, got: {}",
                self.base_url
            )));
        }

        if self.container.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation(
                "store container cannot be empty".to_string(),
            ));
        }

        if self.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(ConfigError::Missing(
                "bearer credential (ANNOLINK_STORE_TOKEN)".to_string(),
            ));
        }

        if self.timeout_seconds == 0 || self.exists_timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn canonicalizer(&self) -> IdCanonicalizer {
        IdCanonicalizer::new(&self.base_url, &self.container)
    }
}
