//! Datastore instrumentation SDK facade.
//!
//! Depend on this crate to get the instrumentation crates behind feature flags
//! so applications can enable only the pieces they use.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use apm_primitives as primitives;

/// Transactions, metric aggregation, and validation (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use apm_telemetry as telemetry;

/// Instrumented datastore client layer (enabled by `datastore` feature).
#[cfg(feature = "datastore")]
pub use apm_datastore as datastore;

/// Configuration management (enabled by `config` feature).
#[cfg(feature = "config")]
pub use apm_config as config;

/// Delivery synchronisation and scenario wiring (enabled by `testkit` feature).
#[cfg(feature = "testkit")]
pub use apm_testkit as testkit;
