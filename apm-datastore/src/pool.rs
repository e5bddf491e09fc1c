//! Bounded connection pool that is itself a [`Transport`].

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use apm_primitives::Product;
use apm_telemetry::CallContext;
use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use crate::client::{Client, ClientOptions};
use crate::transport::{ServerAddress, SubscriberConnection, Transport};
use crate::{Command, DatastoreError, DatastoreResult, Reply};

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    max_connections: NonZeroUsize,
}

impl PoolConfig {
    /// Creates a configuration with the supplied connection limit.
    #[must_use]
    pub const fn new(max_connections: NonZeroUsize) -> Self {
        Self { max_connections }
    }

    /// Returns the connection limit.
    #[must_use]
    pub const fn max_connections(self) -> NonZeroUsize {
        self.max_connections
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(NonZeroUsize::MIN.saturating_add(9))
    }
}

type Factory<T> = Box<dyn Fn() -> DatastoreResult<T> + Send + Sync>;

/// Hands out connections produced by a factory, at most
/// [`PoolConfig::max_connections`] at a time.
pub struct ConnectionPool<T> {
    address: ServerAddress,
    product: Product,
    factory: Factory<T>,
    idle: Mutex<Vec<T>>,
    permits: Semaphore,
    config: PoolConfig,
}

impl<T> std::fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ConnectionPool<T> {
    /// Creates a pool, opening one connection eagerly to learn the server identity.
    ///
    /// # Errors
    ///
    /// Propagates the factory error for the first connection.
    pub fn new<F>(config: PoolConfig, factory: F) -> DatastoreResult<Self>
    where
        F: Fn() -> DatastoreResult<T> + Send + Sync + 'static,
    {
        let first = factory()?;
        let address = first.address().clone();
        let product = first.product().clone();
        Ok(Self {
            address,
            product,
            factory: Box::new(factory),
            idle: Mutex::new(vec![first]),
            permits: Semaphore::new(config.max_connections().get()),
            config,
        })
    }

    /// Returns the associated configuration.
    #[must_use]
    pub const fn config(&self) -> PoolConfig {
        self.config
    }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stops handing out connections; pending and future sends fail with
    /// [`DatastoreError::Closed`].
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    async fn checkout(&self) -> DatastoreResult<(SemaphorePermit<'_>, T)> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DatastoreError::Closed)?;
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                debug!(address = %self.address, "pool opening connection");
                (self.factory)()?
            }
        };
        Ok((permit, conn))
    }

    fn checkin(&self, conn: T) {
        if !self.permits.is_closed() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(conn);
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for ConnectionPool<T> {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    fn product(&self) -> &Product {
        &self.product
    }

    async fn send(&self, ctx: &CallContext, command: Command) -> DatastoreResult<Reply> {
        let (permit, conn) = self.checkout().await?;
        let result = conn.send(ctx, command).await;
        self.checkin(conn);
        drop(permit);
        result
    }

    async fn send_batch(
        &self,
        ctx: &CallContext,
        commands: Vec<Command>,
        atomic: bool,
    ) -> DatastoreResult<Vec<Reply>> {
        let (permit, conn) = self.checkout().await?;
        let result = conn.send_batch(ctx, commands, atomic).await;
        self.checkin(conn);
        drop(permit);
        result
    }

    async fn open_subscriber(&self) -> DatastoreResult<Box<dyn SubscriberConnection>> {
        let conn = (self.factory)()?;
        conn.open_subscriber().await
    }
}

impl<T: Transport> Client<ConnectionPool<T>> {
    /// Creates a client over a pool. Pooled connections skip the
    /// `CLIENT SETINFO` handshake.
    #[must_use]
    pub fn from_pool(pool: ConnectionPool<T>) -> Self {
        Self::with_options(pool, ClientOptions::default().with_client_info(false))
    }
}
