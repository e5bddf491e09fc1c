//! Configuration loaders: JSON documents and `APM_*` environment overrides.

use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::{AgentConfig, ConfigError, ConfigResult};

/// Overrides `datastore.host`.
pub const ENV_DATASTORE_HOST: &str = "APM_DATASTORE_HOST";
/// Overrides `datastore.port`.
pub const ENV_DATASTORE_PORT: &str = "APM_DATASTORE_PORT";
/// Overrides `datastore.product`.
pub const ENV_DATASTORE_PRODUCT: &str = "APM_DATASTORE_PRODUCT";
/// Overrides `local_hostname`.
pub const ENV_LOCAL_HOSTNAME: &str = "APM_LOCAL_HOSTNAME";
/// Overrides `instance_reporting` (`true`/`false`, `1`/`0`, `yes`/`no`).
pub const ENV_INSTANCE_REPORTING: &str = "APM_INSTANCE_REPORTING";
/// Overrides `delivery_timeout_ms`.
pub const ENV_DELIVERY_TIMEOUT_MS: &str = "APM_DELIVERY_TIMEOUT_MS";

impl AgentConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents.
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it is malformed.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded agent configuration");
        Self::from_json_str(&raw)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] when a numeric or boolean variable
    /// cannot be parsed.
    pub fn with_env_overrides(self) -> ConfigResult<Self> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    /// Applies overrides read through `lookup`, which maps a variable name to
    /// its value.
    ///
    /// # Errors
    ///
    /// Same as [`with_env_overrides`](Self::with_env_overrides).
    pub fn with_overrides_from<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_DATASTORE_HOST) {
            self.datastore.host = host;
        }
        if let Some(raw) = lookup(ENV_DATASTORE_PORT) {
            self.datastore.port = parse_number(ENV_DATASTORE_PORT, raw)?;
        }
        if let Some(product) = lookup(ENV_DATASTORE_PRODUCT) {
            self.datastore.product = product;
        }
        if let Some(hostname) = lookup(ENV_LOCAL_HOSTNAME) {
            self.local_hostname = Some(hostname).filter(|h| !h.trim().is_empty());
        }
        if let Some(raw) = lookup(ENV_INSTANCE_REPORTING) {
            self.instance_reporting = parse_flag(ENV_INSTANCE_REPORTING, raw)?;
        }
        if let Some(raw) = lookup(ENV_DELIVERY_TIMEOUT_MS) {
            self.delivery_timeout_ms = parse_number(ENV_DELIVERY_TIMEOUT_MS, raw)?;
        }
        Ok(self)
    }
}

fn parse_number<T>(var: &'static str, raw: String) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::InvalidEnv {
            var,
            reason: err.to_string(),
            value: raw,
        })
}

fn parse_flag(var: &'static str, raw: String) -> ConfigResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw,
            reason: "expected a boolean".to_owned(),
        }),
    }
}
