//! Configuration management for instrumented agents.
//!
//! [`AgentConfig`] is read from JSON, optionally overridden from `APM_*`
//! environment variables, and validated before use.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    ENV_DATASTORE_HOST, ENV_DATASTORE_PORT, ENV_DATASTORE_PRODUCT, ENV_DELIVERY_TIMEOUT_MS,
    ENV_INSTANCE_REPORTING, ENV_LOCAL_HOSTNAME,
};
pub use schema::{AgentConfig, DatastoreSettings};
