//! Strongly typed configuration schema.

use std::time::Duration;

use apm_primitives::{InstanceResolver, Product};
use apm_telemetry::MetricRecorder;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 10_000;

/// Datastore the agent talks to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreSettings {
    /// Product label used in metric names, e.g. `Valkey`.
    pub product: String,
    /// Host as configured; loopback spellings are normalised when reported.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Default for DatastoreSettings {
    fn default() -> Self {
        Self {
            product: "Valkey".to_owned(),
            host: "localhost".to_owned(),
            port: 6379,
        }
    }
}

/// Top-level agent configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Application name attached to log output.
    pub app_name: String,
    /// Datastore target.
    pub datastore: DatastoreSettings,
    /// Whether `Datastore/instance/...` metrics are recorded.
    pub instance_reporting: bool,
    /// Name substituted for loopback hosts. Defaults to the machine host name.
    pub local_hostname: Option<String>,
    /// How long tests wait for an asynchronous delivery.
    pub delivery_timeout_ms: u64,
    /// Whether validation reports unexpected metrics.
    pub strict_validation: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_name: "apm-agent".to_owned(),
            datastore: DatastoreSettings::default(),
            instance_reporting: true,
            local_hostname: None,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            strict_validation: false,
        }
    }
}

impl AgentConfig {
    /// Checks the fields that cannot be defaulted meaningfully.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty host or product, port 0,
    /// or a zero delivery timeout.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.datastore.host.trim().is_empty() {
            return Err(ConfigError::invalid("datastore.host", "must not be empty"));
        }
        if self.datastore.port == 0 {
            return Err(ConfigError::invalid("datastore.port", "must not be 0"));
        }
        self.product()?;
        if self.delivery_timeout_ms == 0 {
            return Err(ConfigError::invalid("delivery_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    /// Returns the datastore product label.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the label is empty or contains `/`.
    pub fn product(&self) -> ConfigResult<Product> {
        Product::new(self.datastore.product.clone())
            .map_err(|err| ConfigError::invalid("datastore.product", err.to_string()))
    }

    /// Builds the resolver used for instance metrics.
    ///
    /// Without an explicit [`local_hostname`](Self::local_hostname) the
    /// machine host name is read once here.
    #[must_use]
    pub fn instance_resolver(&self) -> InstanceResolver {
        self.local_hostname
            .as_deref()
            .map_or_else(InstanceResolver::from_system, InstanceResolver::new)
    }

    /// Builds a recorder honouring [`instance_reporting`](Self::instance_reporting).
    #[must_use]
    pub fn metric_recorder(&self) -> MetricRecorder {
        MetricRecorder::new(self.instance_reporting)
    }

    /// Delivery timeout as a [`Duration`].
    #[must_use]
    pub const fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}
