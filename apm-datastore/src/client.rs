//! High-level datastore client.

use apm_primitives::LibraryVersion;
use apm_telemetry::CallContext;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::pubsub::PubSub;
use crate::transport::Transport;
use crate::{Command, DatastoreError, DatastoreResult, Reply};

/// Library versions from which the connection handshake announces itself with
/// `CLIENT SETINFO`.
const SETINFO_MIN_VERSION: &[u64] = &[5, 0];

/// Connection handshake settings.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    lib_name: String,
    lib_version: Option<LibraryVersion>,
    client_info: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            lib_name: env!("CARGO_PKG_NAME").to_owned(),
            lib_version: LibraryVersion::parse(env!("CARGO_PKG_VERSION")),
            client_info: true,
        }
    }
}

impl ClientOptions {
    /// Sets the library name announced during the handshake.
    #[must_use]
    pub fn with_lib_name(mut self, name: impl Into<String>) -> Self {
        self.lib_name = name.into();
        self
    }

    /// Sets the library version announced during the handshake.
    #[must_use]
    pub fn with_lib_version(mut self, version: Option<LibraryVersion>) -> Self {
        self.lib_version = version;
        self
    }

    /// Enables or disables the `CLIENT SETINFO` handshake.
    #[must_use]
    pub fn with_client_info(mut self, enabled: bool) -> Self {
        self.client_info = enabled;
        self
    }

    /// Returns `true` when the handshake will send `CLIENT SETINFO`.
    #[must_use]
    pub fn sends_client_info(&self) -> bool {
        self.client_info
            && self
                .lib_version
                .as_ref()
                .is_some_and(|v| v.at_least(SETINFO_MIN_VERSION))
    }
}

/// Datastore client over any [`Transport`].
///
/// The connection handshake runs lazily before the first command, under the
/// call context of that command.
#[derive(Debug)]
pub struct Client<T> {
    transport: T,
    options: ClientOptions,
    handshake: OnceCell<()>,
}

impl<T: Transport> Client<T> {
    /// Creates a client with default options.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, ClientOptions::default())
    }

    /// Creates a client with explicit options.
    #[must_use]
    pub fn with_options(transport: T, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            handshake: OnceCell::new(),
        }
    }

    /// Returns the underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn ensure_handshake(&self, ctx: &CallContext) -> DatastoreResult<()> {
        self.handshake
            .get_or_try_init(|| async {
                if !self.options.sends_client_info() {
                    return Ok(());
                }
                let version = self
                    .options
                    .lib_version
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let attrs = [("LIB-NAME", self.options.lib_name.clone()), ("LIB-VER", version)];
                for (attr, value) in attrs {
                    let command = Command::new("CLIENT")
                        .arg("SETINFO")
                        .arg(attr)
                        .arg(Bytes::from(value));
                    // Servers without SETINFO reject it; the connection stays usable.
                    if let Err(err) = self.transport.send(ctx, command).await {
                        debug!(error = %err, attr, "client setinfo rejected");
                    }
                }
                debug!(address = %self.transport.address(), "client handshake complete");
                Ok::<(), DatastoreError>(())
            })
            .await
            .map(|_| ())
    }

    /// Sends an arbitrary command.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the transport or server fails.
    pub async fn execute(&self, ctx: &CallContext, command: Command) -> DatastoreResult<Reply> {
        self.ensure_handshake(ctx).await?;
        self.transport.send(ctx, command).await
    }

    /// Sends a command given as textual parts, e.g. `["CLIENT", "LIST"]`.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] for empty commands and transport failures.
    pub async fn execute_command<S: AsRef<str>>(
        &self,
        ctx: &CallContext,
        parts: &[S],
    ) -> DatastoreResult<Reply> {
        let command = Command::from_parts(parts)?;
        self.execute(ctx, command).await
    }

    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] on transport failure or an unexpected reply.
    pub async fn get(
        &self,
        ctx: &CallContext,
        key: impl Into<Bytes>,
    ) -> DatastoreResult<Option<Bytes>> {
        self.execute(ctx, Command::new("GET").arg(key))
            .await?
            .into_optional_bytes("GET")
    }

    /// Writes a key.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] on transport failure or an unexpected reply.
    pub async fn set(
        &self,
        ctx: &CallContext,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> DatastoreResult<()> {
        let reply = self
            .execute(ctx, Command::new("SET").arg(key).arg(value))
            .await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(DatastoreError::unexpected_reply("SET", format!("{reply:?}")))
        }
    }

    /// Publishes a message, returning the number of receivers.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] on transport failure or an unexpected reply.
    pub async fn publish(
        &self,
        ctx: &CallContext,
        channel: &str,
        message: impl Into<Bytes>,
    ) -> DatastoreResult<u64> {
        let receivers = self
            .execute(
                ctx,
                Command::new("PUBLISH")
                    .arg(Bytes::copy_from_slice(channel.as_bytes()))
                    .arg(message),
            )
            .await?
            .into_integer("PUBLISH")?;
        Ok(u64::try_from(receivers).unwrap_or(0))
    }

    /// Starts a pipeline. With `atomic` the batch is sent as a transaction.
    #[must_use]
    pub fn pipeline(&self, atomic: bool) -> Pipeline<'_, T> {
        Pipeline {
            client: self,
            commands: Vec::new(),
            atomic,
        }
    }

    /// Opens a publish/subscribe handle on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the subscriber connection cannot be opened.
    pub async fn pubsub(&self) -> DatastoreResult<PubSub> {
        let conn = self.transport.open_subscriber().await?;
        Ok(PubSub::new(conn))
    }
}

/// Buffers commands locally and sends them in one batch.
#[derive(Debug)]
pub struct Pipeline<'a, T> {
    client: &'a Client<T>,
    commands: Vec<Command>,
    atomic: bool,
}

impl<T: Transport> Pipeline<'_, T> {
    /// Buffers an arbitrary command.
    pub fn command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Buffers a `SET`.
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.command(Command::new("SET").arg(key).arg(value))
    }

    /// Buffers a `GET`.
    pub fn get(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.command(Command::new("GET").arg(key))
    }

    /// Number of buffered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sends every buffered command. An empty pipeline sends nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the transport or server fails.
    pub async fn execute(&mut self, ctx: &CallContext) -> DatastoreResult<Vec<Reply>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        self.client.ensure_handshake(ctx).await?;
        let commands = std::mem::take(&mut self.commands);
        self.client
            .transport
            .send_batch(ctx, commands, self.atomic)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstrumentedTransport, MemoryServer, ServerAddress};
    use apm_primitives::{InstanceResolver, MetricName, Product};
    use apm_telemetry::{MetricRecorder, Tracer};

    fn client(options: ClientOptions) -> Client<InstrumentedTransport<crate::MemoryTransport>> {
        let server = MemoryServer::new(
            ServerAddress::new("localhost", 6379),
            Product::new("Valkey").unwrap(),
        );
        Client::with_options(
            InstrumentedTransport::new(
                server.connect(),
                MetricRecorder::default(),
                &InstanceResolver::default(),
            ),
            options,
        )
    }

    fn name(s: &str) -> MetricName {
        MetricName::new(s).unwrap()
    }

    #[test]
    fn handshake_requires_recent_library() {
        let old = ClientOptions::default().with_lib_version(LibraryVersion::parse("4.6.0"));
        assert!(!old.sends_client_info());
        let new = ClientOptions::default().with_lib_version(LibraryVersion::parse("6.0.0"));
        assert!(new.sends_client_info());
        assert!(!new.clone().with_client_info(false).sends_client_info());
        assert!(!new.with_lib_version(None).sends_client_info());
    }

    #[tokio::test]
    async fn handshake_runs_once_inside_first_transaction() {
        let client = client(
            ClientOptions::default()
                .with_lib_name("valkey-rs")
                .with_lib_version(LibraryVersion::parse("6.1.0")),
        );
        let guard = Tracer::default().start_background_task("hs").unwrap();
        let ctx = guard.context();
        client.set(&ctx, "k", "v").await.unwrap();
        assert_eq!(client.get(&ctx, "k").await.unwrap(), Some(Bytes::from_static(b"v")));
        let summary = guard.end();

        let setinfo = name("Datastore/operation/Valkey/client_setinfo");
        assert_eq!(summary.metrics.scoped(&setinfo, &summary.call_path), Some(2));
        assert_eq!(summary.metrics.rollup(&name("Datastore/all")), Some(4));
    }

    #[tokio::test]
    async fn pipelines_buffer_without_metrics() {
        let client = client(ClientOptions::default().with_client_info(false));
        let guard = Tracer::default().start_background_task("pipe").unwrap();
        let ctx = guard.context();

        let mut pipe = client.pipeline(true);
        pipe.set("key1", "value1");
        assert_eq!(pipe.len(), 1);
        assert!(guard.transaction().aggregator().snapshot().is_empty());

        let replies = pipe.execute(&ctx).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert!(pipe.is_empty());
        assert!(pipe.execute(&ctx).await.unwrap().is_empty());

        let summary = guard.end();
        assert_eq!(summary.metrics.rollup(&name("Datastore/all")), Some(1));
        assert_eq!(
            summary.metrics.rollup(&name("Datastore/operation/Valkey/set")),
            None
        );
    }

    #[tokio::test]
    async fn execute_command_names_container_operations() {
        let client = client(ClientOptions::default().with_client_info(false));
        let guard = Tracer::default().start_background_task("list").unwrap();
        let ctx = guard.context();
        let reply = client.execute_command(&ctx, &["CLIENT", "LIST"]).await.unwrap();
        assert!(matches!(reply, Reply::Bulk(_)));
        let summary = guard.end();
        assert_eq!(
            summary
                .metrics
                .rollup(&name("Datastore/operation/Valkey/client_list")),
            Some(1)
        );
    }
}
