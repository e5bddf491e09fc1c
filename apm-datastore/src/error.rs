//! Error types for the datastore client layer.

use thiserror::Error;

/// Errors surfaced by transports and clients.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatastoreError {
    /// The command could not be built.
    #[error("invalid command: {reason}")]
    InvalidCommand {
        /// Why the command was rejected.
        reason: String,
    },
    /// The server replied with an error.
    #[error("server error: {message}")]
    Server {
        /// Error text returned by the server.
        message: String,
    },
    /// The reply did not have the expected shape.
    #[error("unexpected reply to {command}: {reason}")]
    UnexpectedReply {
        /// Command verb that produced the reply.
        command: String,
        /// Description of the mismatch.
        reason: String,
    },
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// A pool connection could not be created.
    #[error("connection error: {reason}")]
    Connection {
        /// Additional context about the failure.
        reason: String,
    },
}

impl DatastoreError {
    /// Convenience constructor for invalid commands.
    #[must_use]
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for server errors.
    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Convenience constructor for reply shape mismatches.
    #[must_use]
    pub fn unexpected_reply(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for datastore operations.
pub type DatastoreResult<T> = Result<T, DatastoreError>;
