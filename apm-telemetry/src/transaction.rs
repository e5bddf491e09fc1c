//! Transactions and the call context that carries them across tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use apm_primitives::CallPath;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregator::{AggregatorState, MetricAggregator, MetricTable};
use crate::ladder::TransactionKind;
use crate::{TelemetryError, TelemetryResult};

/// Final state of a transaction handed to validators and exporters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    /// Transaction name.
    pub name: String,
    /// Foreground or background.
    pub kind: TransactionKind,
    /// Scope under which scoped metrics were recorded.
    pub call_path: CallPath,
    /// Aggregated counters.
    pub metrics: MetricTable,
}

#[derive(Debug)]
struct TransactionInner {
    name: String,
    kind: TransactionKind,
    call_path: CallPath,
    aggregator: MetricAggregator,
}

/// A named unit of traced work owning one [`MetricAggregator`].
///
/// Cloning yields another handle to the same transaction.
#[derive(Clone, Debug)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    fn new(name: &str, kind: TransactionKind) -> TelemetryResult<Self> {
        let call_path = match kind {
            TransactionKind::Other => CallPath::background(name)?,
            TransactionKind::Web => CallPath::web(name)?,
        };
        Ok(Self {
            inner: Arc::new(TransactionInner {
                name: name.to_owned(),
                kind,
                call_path,
                aggregator: MetricAggregator::new(name),
            }),
        })
    }

    /// Returns the transaction name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the transaction kind.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.inner.kind
    }

    /// Returns the scope used for scoped metrics.
    #[must_use]
    pub fn call_path(&self) -> &CallPath {
        &self.inner.call_path
    }

    /// Returns the owned aggregator.
    #[must_use]
    pub fn aggregator(&self) -> &MetricAggregator {
        &self.inner.aggregator
    }

    /// Returns `true` until the transaction has ended.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.aggregator.state() == AggregatorState::Open
    }

    /// Flushes the aggregator and returns the final summary.
    ///
    /// Ending an already ended transaction returns the same summary.
    pub fn end(&self) -> TransactionSummary {
        TransactionSummary {
            name: self.inner.name.clone(),
            kind: self.inner.kind,
            call_path: self.inner.call_path.clone(),
            metrics: self.inner.aggregator.flush(),
        }
    }

    /// Returns `true` when both handles refer to the same transaction.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Explicitly propagated continuation token.
///
/// Pass it down call chains and move clones into spawned tasks; any code
/// holding a clone records into the same transaction regardless of which
/// worker thread it runs on.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    transaction: Option<Transaction>,
}

impl CallContext {
    /// Context with no transaction; records made through it are dropped.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns the carried transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Returns `true` when the context carries a transaction that has not ended.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.transaction.as_ref().is_some_and(Transaction::is_open)
    }

    fn child(&self, name: &str, kind: TransactionKind) -> TelemetryResult<(Self, Transaction)> {
        if let Some(active) = self.transaction.as_ref().filter(|t| t.is_open()) {
            return Err(TelemetryError::NestedTransaction {
                active: active.name().to_owned(),
                requested: name.to_owned(),
            });
        }
        let transaction = Transaction::new(name, kind)?;
        let ctx = Self {
            transaction: Some(transaction.clone()),
        };
        Ok((ctx, transaction))
    }
}

/// Receives finished transactions.
pub trait TransactionSink: Send + Sync {
    /// Called exactly once per transaction when it ends or is dropped.
    fn record(&self, summary: TransactionSummary);
}

/// Sink that discards summaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TransactionSink for NullSink {
    fn record(&self, _summary: TransactionSummary) {}
}

/// Sink that keeps every summary in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    summaries: Mutex<Vec<TransactionSummary>>,
}

impl CollectingSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Removes and returns the collected summaries.
    #[must_use]
    pub fn drain(&self) -> Vec<TransactionSummary> {
        let mut lock = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        lock.drain(..).collect()
    }
}

impl TransactionSink for CollectingSink {
    fn record(&self, summary: TransactionSummary) {
        self.summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(summary);
    }
}

/// Starts transactions and delivers their summaries to a sink.
#[derive(Clone)]
pub struct Tracer {
    sink: Arc<dyn TransactionSink>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl Tracer {
    /// Creates a tracer delivering finished transactions to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn TransactionSink>) -> Self {
        Self { sink }
    }

    /// Begins a transaction beneath `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NestedTransaction`] when `parent` already carries
    /// an open transaction, and [`TelemetryError::InvalidName`] for a blank name.
    pub fn begin(
        &self,
        parent: &CallContext,
        name: &str,
        background: bool,
    ) -> TelemetryResult<TransactionGuard> {
        let kind = TransactionKind::from_background(background);
        let (ctx, transaction) = parent.child(name, kind)?;
        debug!(transaction = %name, %kind, "transaction started");
        Ok(TransactionGuard {
            ctx,
            transaction,
            sink: Arc::clone(&self.sink),
            ended: AtomicBool::new(false),
        })
    }

    /// Begins a top-level background transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`] for a blank name.
    pub fn start_background_task(&self, name: &str) -> TelemetryResult<TransactionGuard> {
        self.begin(&CallContext::root(), name, true)
    }

    /// Begins a top-level web transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`] for a blank name.
    pub fn start_web_transaction(&self, name: &str) -> TelemetryResult<TransactionGuard> {
        self.begin(&CallContext::root(), name, false)
    }

    /// Runs the future produced by `body` inside a background transaction.
    ///
    /// The transaction ends when the future completes, whatever its output. If the
    /// returned future is dropped before completion the transaction still ends
    /// and its partial metrics reach the sink.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`] for a blank name.
    pub async fn run_background_task<F, Fut, T>(
        &self,
        name: &str,
        body: F,
    ) -> TelemetryResult<(T, TransactionSummary)>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.start_background_task(name)?;
        let output = body(guard.context()).await;
        Ok((output, guard.end()))
    }
}

/// Owns the lifetime of one transaction.
///
/// Ending is explicit via [`end`](Self::end); dropping the guard ends the
/// transaction as well, so cancelled or panicking units still flush.
pub struct TransactionGuard {
    ctx: CallContext,
    transaction: Transaction,
    sink: Arc<dyn TransactionSink>,
    ended: AtomicBool,
}

impl std::fmt::Debug for TransactionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionGuard")
            .field("transaction", &self.transaction.name())
            .field("ended", &self.ended.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl TransactionGuard {
    /// Returns a context token carrying this transaction.
    #[must_use]
    pub fn context(&self) -> CallContext {
        self.ctx.clone()
    }

    /// Returns the transaction handle.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Ends the transaction, delivering the summary to the sink once.
    pub fn end(self) -> TransactionSummary {
        self.finish()
    }

    fn finish(&self) -> TransactionSummary {
        let summary = self.transaction.end();
        if !self.ended.swap(true, Ordering::AcqRel) {
            debug!(
                transaction = %summary.name,
                kind = %summary.kind,
                rollups = summary.metrics.rollup_entries().count(),
                "transaction ended"
            );
            self.sink.record(summary.clone());
        }
        summary
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if !self.ended.load(Ordering::Acquire) {
            warn!(
                transaction = %self.transaction.name(),
                "transaction dropped before end; flushing partial metrics"
            );
            let _ = self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_primitives::MetricName;

    #[test]
    fn nested_transactions_are_rejected() {
        let tracer = Tracer::default();
        let outer = tracer.start_background_task("outer").unwrap();
        let err = tracer
            .begin(&outer.context(), "inner", true)
            .expect_err("nesting must fail");
        assert!(matches!(err, TelemetryError::NestedTransaction { .. }));
    }

    #[test]
    fn ended_context_may_start_a_new_transaction() {
        let tracer = Tracer::default();
        let first = tracer.start_background_task("first").unwrap();
        let ctx = first.context();
        first.end();
        assert!(!ctx.is_active());
        let second = tracer.begin(&ctx, "second", false).unwrap();
        assert!(second.context().is_active());
        assert_eq!(second.transaction().kind(), TransactionKind::Web);
    }

    #[test]
    fn blank_names_are_rejected() {
        let tracer = Tracer::default();
        assert!(matches!(
            tracer.start_background_task("  "),
            Err(TelemetryError::InvalidName(_))
        ));
    }

    #[test]
    fn dropping_guard_flushes_partial_metrics() {
        let sink = CollectingSink::new();
        let tracer = Tracer::new(sink.clone());
        let guard = tracer.start_background_task("cancelled").unwrap();
        let ctx = guard.context();
        let metric = MetricName::new("Datastore/all").unwrap();
        ctx.transaction()
            .unwrap()
            .aggregator()
            .record_rollup(&[metric.clone()], 1)
            .unwrap();
        drop(guard);

        let summaries = sink.drain();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].metrics.rollup(&metric), Some(1));
        assert!(!ctx.is_active());
    }

    #[test]
    fn explicit_end_delivers_once() {
        let sink = CollectingSink::new();
        let tracer = Tracer::new(sink.clone());
        let guard = tracer.start_background_task("once").unwrap();
        let handle = guard.transaction().clone();
        let summary = guard.end();
        assert_eq!(handle.end(), summary);
        assert_eq!(sink.drain().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn context_survives_resumption_on_other_workers() {
        let tracer = Tracer::default();
        let metric = MetricName::new("Datastore/operation/Valkey/get").unwrap();
        let (_, summary) = tracer
            .run_background_task("hops", |ctx| {
                let metric = metric.clone();
                async move {
                    let mut handles = Vec::new();
                    for _ in 0..16 {
                        let ctx = ctx.clone();
                        let metric = metric.clone();
                        handles.push(tokio::spawn(async move {
                            for _ in 0..10 {
                                tokio::task::yield_now().await;
                                let txn = ctx.transaction().unwrap();
                                txn.aggregator()
                                    .record_scoped(&metric, txn.call_path(), 1)
                                    .unwrap();
                            }
                        }));
                    }
                    for handle in handles {
                        handle.await.unwrap();
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(summary.metrics.scoped(&metric, &summary.call_path), Some(160));
    }
}
