//! Wiring for end-to-end scenarios against the in-memory server.

use apm_datastore::{
    Client, ClientOptions, ConnectionPool, DatastoreResult, InstrumentedTransport, MemoryServer,
    MemoryTransport, PoolConfig, ServerAddress,
};
use apm_primitives::{InstanceResolver, Product};
use apm_telemetry::MetricRecorder;

/// Instrumented connection to the scenario server.
pub type InstrumentedMemory = InstrumentedTransport<MemoryTransport>;

/// An in-memory server plus the instrumentation settings applied to every
/// connection opened against it.
#[derive(Clone, Debug)]
pub struct ScenarioEnv {
    server: MemoryServer,
    recorder: MetricRecorder,
    resolver: InstanceResolver,
}

impl ScenarioEnv {
    /// Creates a server for `product` at `host:port` with instance reporting
    /// enabled and loopback hosts reported under the machine host name.
    #[must_use]
    pub fn new(product: Product, host: &str, port: u16) -> Self {
        Self {
            server: MemoryServer::new(ServerAddress::new(host, port), product),
            recorder: MetricRecorder::default(),
            resolver: InstanceResolver::default(),
        }
    }

    /// Overrides the recorder.
    #[must_use]
    pub fn with_recorder(mut self, recorder: MetricRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Overrides the instance resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: InstanceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Returns the underlying server.
    #[must_use]
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }

    /// Returns the resolver used for instance metrics.
    #[must_use]
    pub fn resolver(&self) -> &InstanceResolver {
        &self.resolver
    }

    /// Opens one instrumented connection.
    #[must_use]
    pub fn connect(&self) -> InstrumentedMemory {
        InstrumentedTransport::new(self.server.connect(), self.recorder, &self.resolver)
    }

    /// Creates a direct client with `options`.
    #[must_use]
    pub fn client(&self, options: ClientOptions) -> Client<InstrumentedMemory> {
        Client::with_options(self.connect(), options)
    }

    /// Creates a client backed by a pool of instrumented connections.
    ///
    /// # Errors
    ///
    /// Propagates failures opening the first pooled connection.
    pub fn pooled_client(
        &self,
        config: PoolConfig,
    ) -> DatastoreResult<Client<ConnectionPool<InstrumentedMemory>>> {
        let env = self.clone();
        let pool = ConnectionPool::new(config, move || Ok(env.connect()))?;
        Ok(Client::from_pool(pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_telemetry::Tracer;

    #[tokio::test]
    async fn pooled_clients_share_one_server() {
        let env = ScenarioEnv::new(Product::new("Valkey").unwrap(), "localhost", 6379);
        let client = env.pooled_client(PoolConfig::default()).unwrap();
        let guard = Tracer::default().start_background_task("pooled").unwrap();
        let ctx = guard.context();
        client.set(&ctx, "k", "v").await.unwrap();

        let direct = env.client(ClientOptions::default().with_client_info(false));
        let value = direct.get(&ctx, "k").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"v"[..]));
        assert_eq!(env.server().connection_count(), 2);
        guard.end();
    }
}
