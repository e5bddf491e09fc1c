//! Metric and scope naming types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Hierarchical, slash separated metric name such as `Datastore/operation/Valkey/get`.
///
/// Names are immutable once built and cheap to clone.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricName(Arc<str>);

impl MetricName {
    /// Creates a metric name from its full textual form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetricName`] when the name is blank or contains an
    /// empty segment.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidMetricName {
                name,
                reason: "metric name cannot be empty",
            });
        }
        if name.split('/').any(str::is_empty) {
            return Err(Error::InvalidMetricName {
                name,
                reason: "metric name segments cannot be empty",
            });
        }
        Ok(Self(Arc::from(name)))
    }

    /// Creates a single-segment root name. Intended for static category names.
    #[must_use]
    pub fn root(category: &'static str) -> Self {
        Self(Arc::from(category))
    }

    /// Returns a new name with `segment` appended.
    ///
    /// Segments are expected to come from validated types ([`Product`],
    /// [`Operation`], [`InstanceId`](crate::InstanceId)).
    #[must_use]
    pub fn child(&self, segment: impl Display) -> Self {
        Self(Arc::from(format!("{}/{segment}", self.0)))
    }

    /// Returns the textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the slash separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl Display for MetricName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MetricName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for MetricName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for MetricName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MetricName> for String {
    fn from(value: MetricName) -> Self {
        value.0.to_string()
    }
}

impl AsRef<str> for MetricName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Scope name identifying the unit of traced work a scoped metric belongs to.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallPath(Arc<str>);

impl CallPath {
    /// Creates a call path from its full textual form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCallPath`] when the path is blank.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.trim().is_empty() {
            return Err(Error::InvalidCallPath {
                path,
                reason: "call path cannot be empty",
            });
        }
        Ok(Self(Arc::from(path)))
    }

    /// Scope used by background (task-driven) transactions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCallPath`] when `name` is blank.
    pub fn background(name: &str) -> Result<Self> {
        Self::function("OtherTransaction", name)
    }

    /// Scope used by foreground (request-driven) transactions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCallPath`] when `name` is blank.
    pub fn web(name: &str) -> Result<Self> {
        Self::function("WebTransaction", name)
    }

    fn function(prefix: &str, name: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::InvalidCallPath {
                path: name.to_owned(),
                reason: "transaction name cannot be empty",
            });
        }
        Ok(Self(Arc::from(format!("{prefix}/Function/{name}"))))
    }

    /// Returns the textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CallPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Datastore product label (e.g. `Valkey`).
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Product(Arc<str>);

impl Product {
    /// Creates a product label.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProduct`] when the label is blank or contains `/`.
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let product = label.into();
        if product.trim().is_empty() {
            return Err(Error::InvalidProduct {
                product,
                reason: "product cannot be empty",
            });
        }
        if product.contains('/') {
            return Err(Error::InvalidProduct {
                product,
                reason: "product cannot contain `/`",
            });
        }
        Ok(Self(Arc::from(product.trim())))
    }

    /// Returns the label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Product {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Product {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Product> for String {
    fn from(value: Product) -> Self {
        value.0.to_string()
    }
}

/// Lower-cased datastore operation name (e.g. `get`, `client_list`).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Operation(Arc<str>);

impl Operation {
    /// Creates an operation name, lower-casing the input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] when the name is blank or contains `/`
    /// or whitespace.
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let raw = name.as_ref().trim();
        if raw.is_empty() {
            return Err(Error::InvalidOperation {
                operation: raw.to_owned(),
                reason: "operation cannot be empty",
            });
        }
        if raw.contains('/') || raw.contains(char::is_whitespace) {
            return Err(Error::InvalidOperation {
                operation: raw.to_owned(),
                reason: "operation cannot contain `/` or whitespace",
            });
        }
        Ok(Self(Arc::from(raw.to_ascii_lowercase())))
    }

    /// Returns the operation name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
