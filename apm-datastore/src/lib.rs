//! Datastore client layer used by instrumented applications.
//!
//! The [`Transport`] trait is the network boundary. [`InstrumentedTransport`]
//! decorates any transport and records one datastore event per command that
//! reaches it, so buffering done above the transport (for example by a
//! [`Pipeline`]) never produces metrics of its own. [`MemoryServer`] provides an
//! in-process backend with key/value and publish/subscribe support.

#![warn(missing_docs, clippy::pedantic)]

pub mod client;
pub mod command;
mod error;
pub mod instrumented;
pub mod memory;
pub mod pool;
pub mod pubsub;
pub mod transport;

pub use client::{Client, ClientOptions, Pipeline};
pub use command::{Command, Reply};
pub use error::{DatastoreError, DatastoreResult};
pub use instrumented::InstrumentedTransport;
pub use memory::{MemoryServer, MemoryTransport};
pub use pool::{ConnectionPool, PoolConfig};
pub use pubsub::{MessageKind, PubSub, PubSubMessage};
pub use transport::{ServerAddress, SubscriberConnection, Transport};
