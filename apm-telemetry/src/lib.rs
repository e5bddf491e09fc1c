//! Transaction-scoped telemetry for instrumented datastore calls.
//!
//! Operations are recorded through a [`MetricRecorder`] into the
//! [`MetricAggregator`] owned by the transaction carried on a [`CallContext`].
//! The context is an explicit token: it is cloned into spawned tasks and moved
//! across `.await` points, so resumption on another worker thread still records
//! into the same aggregator. Finished transactions are compared against an
//! [`ExpectedMetrics`] table with [`validate`], and a [`StatsEngine`] sink sums
//! them per process or per harvested window.

#![warn(missing_docs, clippy::pedantic)]

mod aggregator;
mod error;
mod ladder;
mod recorder;
mod stats;
mod transaction;
mod validator;

pub use aggregator::{AggregatorState, MetricAggregator, MetricTable};
pub use error::{TelemetryError, TelemetryResult};
pub use ladder::{DatastoreEvent, TransactionKind, ladder, operation_metric};
pub use recorder::MetricRecorder;
pub use stats::{HarvestedStats, StatsEngine};
pub use transaction::{
    CallContext, CollectingSink, NullSink, Tracer, Transaction, TransactionGuard,
    TransactionSink, TransactionSummary,
};
pub use validator::{
    ExpectedCount, ExpectedMetrics, MetricScope, Mismatch, ValidationMismatchError,
    ValidationReport, validate,
};
