//! Transport decorator that records datastore metrics.

use apm_primitives::{InstanceId, InstanceResolver, Operation, Product};
use apm_telemetry::{CallContext, DatastoreEvent, MetricRecorder};
use async_trait::async_trait;
use tracing::warn;

use crate::transport::{ServerAddress, SubscriberConnection, Transport};
use crate::{Command, DatastoreResult, Reply};

const PIPELINE: &str = "pipeline";
const MULTI: &str = "multi";

/// Wraps a [`Transport`], recording one datastore event per command sent.
///
/// Batches record a single `pipeline` event, or `multi` when atomic. Recording
/// failures are logged and never change the wrapped call's result.
#[derive(Debug)]
pub struct InstrumentedTransport<T> {
    inner: T,
    recorder: MetricRecorder,
    instance: InstanceId,
}

impl<T: Transport> InstrumentedTransport<T> {
    /// Wraps `inner`, resolving its address once with `resolver`.
    #[must_use]
    pub fn new(inner: T, recorder: MetricRecorder, resolver: &InstanceResolver) -> Self {
        let instance = resolver.resolve(inner.address().host(), inner.address().port());
        Self {
            inner,
            recorder,
            instance,
        }
    }

    /// Returns the canonical instance this transport reports.
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Returns the wrapped transport.
    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn observe(&self, ctx: &CallContext, operation: apm_primitives::Result<Operation>) {
        let operation = match operation {
            Ok(operation) => operation,
            Err(err) => {
                warn!(error = %err, "cannot name datastore operation; metric skipped");
                return;
            }
        };
        let event = DatastoreEvent::new(self.inner.product().clone(), operation)
            .with_instance(self.instance.clone());
        if let Err(err) = self.recorder.record_datastore(ctx, &event) {
            warn!(
                error = %err,
                operation = %event.operation(),
                "datastore metric dropped"
            );
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for InstrumentedTransport<T> {
    fn address(&self) -> &ServerAddress {
        self.inner.address()
    }

    fn product(&self) -> &Product {
        self.inner.product()
    }

    async fn send(&self, ctx: &CallContext, command: Command) -> DatastoreResult<Reply> {
        let operation = command.operation();
        let result = self.inner.send(ctx, command).await;
        self.observe(ctx, operation);
        result
    }

    async fn send_batch(
        &self,
        ctx: &CallContext,
        commands: Vec<Command>,
        atomic: bool,
    ) -> DatastoreResult<Vec<Reply>> {
        let result = self.inner.send_batch(ctx, commands, atomic).await;
        self.observe(ctx, Operation::new(if atomic { MULTI } else { PIPELINE }));
        result
    }

    async fn open_subscriber(&self) -> DatastoreResult<Box<dyn SubscriberConnection>> {
        self.inner.open_subscriber().await
    }
}
