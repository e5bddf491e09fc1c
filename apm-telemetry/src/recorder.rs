//! Records metric events into the transaction carried by a call context.

use std::borrow::Cow;

use apm_primitives::MetricName;
use tracing::{debug, trace};

use crate::ladder::DatastoreEvent;
use crate::transaction::CallContext;
use crate::{TelemetryError, TelemetryResult};

/// Emits metric events into the active transaction's aggregator.
#[derive(Clone, Copy, Debug)]
pub struct MetricRecorder {
    instance_reporting: bool,
}

impl Default for MetricRecorder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MetricRecorder {
    /// Creates a recorder. With `instance_reporting` disabled the
    /// `Datastore/instance/...` rung is never recorded.
    #[must_use]
    pub const fn new(instance_reporting: bool) -> Self {
        Self { instance_reporting }
    }

    /// Returns whether instance metrics are recorded.
    #[must_use]
    pub const fn instance_reporting(self) -> bool {
        self.instance_reporting
    }

    /// Records `delta` against `name`, both scoped to the context's call path and
    /// rolled up.
    ///
    /// Recording without an active transaction is silently dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] when the transaction already ended.
    pub fn record(self, ctx: &CallContext, name: &MetricName, delta: u64) -> TelemetryResult<()> {
        swallow_missing(self.try_record(ctx, name, delta))
    }

    /// Like [`record`](Self::record) but reports a missing transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::MissingContext`] with no transaction on `ctx`, and
    /// [`TelemetryError::InvalidState`] when the transaction already ended.
    pub fn try_record(
        self,
        ctx: &CallContext,
        name: &MetricName,
        delta: u64,
    ) -> TelemetryResult<()> {
        let txn = ctx.transaction().ok_or(TelemetryError::MissingContext)?;
        trace!(transaction = %txn.name(), metric = %name, delta, "record");
        txn.aggregator().record(
            Some((name, txn.call_path())),
            std::slice::from_ref(name),
            delta,
        )
    }

    /// Records one datastore operation: a scoped operation metric plus its full
    /// rollup ladder.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] when the transaction already ended.
    pub fn record_datastore(self, ctx: &CallContext, event: &DatastoreEvent) -> TelemetryResult<()> {
        swallow_missing(self.try_record_datastore(ctx, event))
    }

    /// Like [`record_datastore`](Self::record_datastore) but reports a missing
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::MissingContext`] with no transaction on `ctx`, and
    /// [`TelemetryError::InvalidState`] when the transaction already ended.
    pub fn try_record_datastore(
        self,
        ctx: &CallContext,
        event: &DatastoreEvent,
    ) -> TelemetryResult<()> {
        let txn = ctx.transaction().ok_or(TelemetryError::MissingContext)?;
        let event = if self.instance_reporting {
            Cow::Borrowed(event)
        } else {
            Cow::Owned(event.clone().without_instance())
        };
        trace!(
            transaction = %txn.name(),
            operation = %event.operation(),
            instance = event.instance().is_some(),
            "record datastore operation"
        );
        txn.aggregator()
            .record_event(&event, txn.kind(), txn.call_path(), 1)
    }
}

fn swallow_missing(result: TelemetryResult<()>) -> TelemetryResult<()> {
    match result {
        Err(TelemetryError::MissingContext) => {
            debug!("metric recorded outside a transaction; dropped");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Tracer;
    use apm_primitives::{InstanceResolver, Operation, Product};

    fn event(op: &str) -> DatastoreEvent {
        DatastoreEvent::new(Product::new("Valkey").unwrap(), Operation::new(op).unwrap())
            .with_instance(InstanceResolver::new("host").resolve("localhost", 6379))
    }

    #[test]
    fn missing_context_is_dropped() {
        let recorder = MetricRecorder::default();
        let ctx = CallContext::root();
        assert!(recorder.record_datastore(&ctx, &event("get")).is_ok());
        assert!(matches!(
            recorder.try_record_datastore(&ctx, &event("get")),
            Err(TelemetryError::MissingContext)
        ));
    }

    #[test]
    fn one_event_bumps_every_rung_once() {
        let tracer = Tracer::default();
        let guard = tracer.start_background_task("ladder").unwrap();
        MetricRecorder::default()
            .record_datastore(&guard.context(), &event("set"))
            .unwrap();
        let summary = guard.end();

        let rollups: Vec<_> = summary.metrics.rollup_entries().collect();
        assert_eq!(rollups.len(), 6);
        assert!(rollups.iter().all(|(_, count)| *count == 1));
        let scoped: Vec<_> = summary.metrics.scoped_entries().collect();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].1.as_str(), "Datastore/operation/Valkey/set");
    }

    #[test]
    fn instance_reporting_can_be_disabled() {
        let tracer = Tracer::default();
        let guard = tracer.start_background_task("no-instance").unwrap();
        MetricRecorder::new(false)
            .record_datastore(&guard.context(), &event("get"))
            .unwrap();
        let summary = guard.end();
        assert_eq!(summary.metrics.rollup_entries().count(), 5);
    }

    #[test]
    fn recording_after_end_fails_without_side_effects() {
        let tracer = Tracer::default();
        let guard = tracer.start_background_task("late").unwrap();
        let ctx = guard.context();
        let recorder = MetricRecorder::default();
        recorder.record_datastore(&ctx, &event("get")).unwrap();
        let summary = guard.end();

        let err = recorder
            .record_datastore(&ctx, &event("get"))
            .expect_err("ended transaction must reject records");
        assert!(matches!(err, TelemetryError::InvalidState { .. }));
        assert_eq!(ctx.transaction().unwrap().end(), summary);
    }

    #[test]
    fn generic_record_counts_scoped_and_rollup() {
        let tracer = Tracer::default();
        let guard = tracer.start_background_task("generic").unwrap();
        let ctx = guard.context();
        let name = MetricName::new("Custom/thing").unwrap();
        for _ in 0..3 {
            MetricRecorder::default().record(&ctx, &name, 1).unwrap();
        }
        let summary = guard.end();
        assert_eq!(summary.metrics.rollup(&name), Some(3));
        assert_eq!(summary.metrics.scoped(&name, &summary.call_path), Some(3));
    }
}
