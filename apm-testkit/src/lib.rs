//! Test support for instrumented datastore code.
//!
//! The [`delivery`] module provides the single-slot event used to wait for
//! asynchronous pub/sub deliveries without polling, [`reader`] hosts the
//! background task that drains a subscription into a [`ReceiptLog`], and
//! [`scenario`] wires an in-memory server to instrumented clients.

#![warn(missing_docs, clippy::pedantic)]

pub mod delivery;
pub mod reader;
pub mod scenario;

pub use delivery::{DeliveryError, DeliveryResult, DeliverySignal, DeliveryWaiter, delivery_channel};
pub use reader::{DEFAULT_SENTINEL, ReceiptLog, publish_and_confirm, spawn_reader};
pub use scenario::ScenarioEnv;
