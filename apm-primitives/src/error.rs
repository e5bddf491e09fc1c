//! Shared error definitions for telemetry primitives.

use thiserror::Error;

/// Result alias used throughout the telemetry workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing primitive types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Metric name failed validation.
    #[error("invalid metric name `{name}`: {reason}")]
    InvalidMetricName {
        /// The offending name.
        name: String,
        /// Human-readable reason for rejection.
        reason: &'static str,
    },

    /// Call path failed validation.
    #[error("invalid call path `{path}`: {reason}")]
    InvalidCallPath {
        /// The offending path.
        path: String,
        /// Human-readable reason for rejection.
        reason: &'static str,
    },

    /// Datastore product label failed validation.
    #[error("invalid datastore product `{product}`: {reason}")]
    InvalidProduct {
        /// The offending label.
        product: String,
        /// Human-readable reason for rejection.
        reason: &'static str,
    },

    /// Datastore operation name failed validation.
    #[error("invalid datastore operation `{operation}`: {reason}")]
    InvalidOperation {
        /// The offending operation.
        operation: String,
        /// Human-readable reason for rejection.
        reason: &'static str,
    },
}
