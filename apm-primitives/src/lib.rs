//! Core shared types for datastore telemetry.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod instance;
mod name;
mod version;

/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Canonical datastore instance labels.
pub use instance::{InstanceId, InstanceResolver};
/// Hierarchical metric and scope names.
pub use name::{CallPath, MetricName, Operation, Product};
/// Client library version parsing.
pub use version::{LibraryVersion, VersionPart};
