//! Error types for the telemetry subsystem.

use thiserror::Error;

/// Errors emitted while recording or scoping telemetry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// A metric was recorded after the owning transaction flushed.
    #[error("transaction `{transaction}` already flushed; metric dropped")]
    InvalidState {
        /// Name of the flushed transaction.
        transaction: String,
    },
    /// A metric was recorded with no active transaction on the context.
    #[error("no active transaction on the call context")]
    MissingContext,
    /// A transaction was started on a context that already carries one.
    #[error("transaction `{requested}` cannot start inside active transaction `{active}`")]
    NestedTransaction {
        /// Name of the currently active transaction.
        active: String,
        /// Name of the transaction that was refused.
        requested: String,
    },
    /// A metric or scope name failed validation.
    #[error(transparent)]
    InvalidName(#[from] apm_primitives::Error),
}

impl TelemetryError {
    /// Helper to construct [`TelemetryError::InvalidState`].
    #[must_use]
    pub fn invalid_state(transaction: impl Into<String>) -> Self {
        Self::InvalidState {
            transaction: transaction.into(),
        }
    }
}

/// Result type alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
