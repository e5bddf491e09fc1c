//! Process-wide aggregation of finished transactions.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::aggregator::MetricTable;
use crate::transaction::{TransactionSink, TransactionSummary};

/// Counters merged from every transaction that ended during one window.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct HarvestedStats {
    /// Number of transactions merged into [`metrics`](Self::metrics).
    pub transactions: u64,
    /// Summed scoped and rollup counters.
    pub metrics: MetricTable,
    /// Time between the start of the window and the harvest.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    transactions: u64,
    metrics: MetricTable,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            transactions: 0,
            metrics: MetricTable::default(),
        }
    }
}

/// Sink merging every summary into a process-wide [`MetricTable`].
///
/// Without a harvest the window spans the process lifetime;
/// [`harvest`](Self::harvest) closes the current window and opens a new one.
#[derive(Debug)]
pub struct StatsEngine {
    window: Mutex<Window>,
}

impl Default for StatsEngine {
    fn default() -> Self {
        Self {
            window: Mutex::new(Window::new()),
        }
    }
}

impl StatsEngine {
    /// Creates an engine with an empty window.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the current window without resetting it.
    #[must_use]
    pub fn snapshot(&self) -> HarvestedStats {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        HarvestedStats {
            transactions: window.transactions,
            metrics: window.metrics.clone(),
            elapsed: window.started.elapsed(),
        }
    }

    /// Returns the current window and starts a fresh one.
    #[must_use]
    pub fn harvest(&self) -> HarvestedStats {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let closed = std::mem::replace(&mut *window, Window::new());
        debug!(transactions = closed.transactions, "stats window harvested");
        HarvestedStats {
            transactions: closed.transactions,
            metrics: closed.metrics,
            elapsed: closed.started.elapsed(),
        }
    }
}

impl TransactionSink for StatsEngine {
    fn record(&self, summary: TransactionSummary) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.metrics.merge(&summary.metrics);
        window.transactions = window.transactions.saturating_add(1);
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(value.as_millis())
    }
}
