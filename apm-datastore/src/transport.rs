//! Network boundary between clients and datastore servers.

use std::fmt;

use apm_primitives::Product;
use apm_telemetry::CallContext;
use async_trait::async_trait;

use crate::pubsub::PubSubMessage;
use crate::{Command, DatastoreResult, Reply};

/// Host and port a transport is connected to, as configured by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Creates an address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host exactly as configured.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A connection able to carry commands to a datastore.
///
/// The call context is threaded through every call so decorators can attribute
/// work to the caller's transaction; plain transports ignore it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address this transport talks to.
    fn address(&self) -> &ServerAddress;

    /// Datastore product label.
    fn product(&self) -> &Product;

    /// Sends one command and waits for its reply.
    async fn send(&self, ctx: &CallContext, command: Command) -> DatastoreResult<Reply>;

    /// Sends a batch of commands in one round trip. With `atomic` the batch is
    /// wrapped in `MULTI`/`EXEC`.
    async fn send_batch(
        &self,
        ctx: &CallContext,
        commands: Vec<Command>,
        atomic: bool,
    ) -> DatastoreResult<Vec<Reply>>;

    /// Opens a dedicated subscriber connection.
    async fn open_subscriber(&self) -> DatastoreResult<Box<dyn SubscriberConnection>>;
}

/// Connection in subscriber mode.
#[async_trait]
pub trait SubscriberConnection: Send {
    /// Subscribes to exact channel names.
    async fn subscribe(&mut self, channels: &[String]) -> DatastoreResult<()>;

    /// Subscribes to glob patterns.
    async fn psubscribe(&mut self, patterns: &[String]) -> DatastoreResult<()>;

    /// Waits for the next pushed message. `None` once the connection is closed.
    async fn next_message(&mut self) -> Option<PubSubMessage>;

    /// Leaves subscriber mode and closes the connection.
    async fn close(&mut self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn address(&self) -> &ServerAddress {
        (**self).address()
    }

    fn product(&self) -> &Product {
        (**self).product()
    }

    async fn send(&self, ctx: &CallContext, command: Command) -> DatastoreResult<Reply> {
        (**self).send(ctx, command).await
    }

    async fn send_batch(
        &self,
        ctx: &CallContext,
        commands: Vec<Command>,
        atomic: bool,
    ) -> DatastoreResult<Vec<Reply>> {
        (**self).send_batch(ctx, commands, atomic).await
    }

    async fn open_subscriber(&self) -> DatastoreResult<Box<dyn SubscriberConnection>> {
        (**self).open_subscriber().await
    }
}
