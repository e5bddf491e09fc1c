//! Per-transaction scoped and rollup metric counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use apm_primitives::{CallPath, MetricName};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::ladder::{DatastoreEvent, TransactionKind, ladder, operation_metric};
use crate::{TelemetryError, TelemetryResult};

/// Lifecycle of an aggregator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorState {
    /// Accepting records.
    Open,
    /// Frozen; every further record fails.
    Flushed,
}

type Counter = Arc<AtomicU64>;

#[derive(Debug)]
struct Counters {
    state: AggregatorState,
    scoped: HashMap<(MetricName, CallPath), Counter>,
    rollup: HashMap<MetricName, Counter>,
    flushed: Option<MetricTable>,
}

/// Scoped and rollup counters belonging to one transaction.
///
/// Recorders share a read lock and bump per-name atomics, so records against
/// unrelated names never serialize on each other. [`snapshot`](Self::snapshot)
/// and [`flush`](Self::flush) take the write lock, which keeps every
/// multi-name record atomic with respect to readers.
#[derive(Debug)]
pub struct MetricAggregator {
    owner: String,
    counters: RwLock<Counters>,
}

impl MetricAggregator {
    /// Creates an open aggregator owned by the named transaction.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            counters: RwLock::new(Counters {
                state: AggregatorState::Open,
                scoped: HashMap::new(),
                rollup: HashMap::new(),
                flushed: None,
            }),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> AggregatorState {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Adds `delta` to one scoped counter.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] once the aggregator has flushed.
    pub fn record_scoped(
        &self,
        name: &MetricName,
        path: &CallPath,
        delta: u64,
    ) -> TelemetryResult<()> {
        self.record(Some((name, path)), &[], delta)
    }

    /// Adds `delta` to every rollup counter in `names`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] once the aggregator has flushed.
    pub fn record_rollup(&self, names: &[MetricName], delta: u64) -> TelemetryResult<()> {
        self.record(None, names, delta)
    }

    /// Adds `delta` to one scoped counter and every rollup counter in one atomic step.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] once the aggregator has flushed.
    pub fn record(
        &self,
        scoped: Option<(&MetricName, &CallPath)>,
        rollup: &[MetricName],
        delta: u64,
    ) -> TelemetryResult<()> {
        {
            let guard = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if guard.state == AggregatorState::Flushed {
                return Err(TelemetryError::invalid_state(&self.owner));
            }
            let scoped_counter =
                scoped.and_then(|(name, path)| guard.scoped.get(&(name.clone(), path.clone())));
            let scoped_ready = scoped.is_none() || scoped_counter.is_some();
            let rollup_counters: Option<Vec<&Counter>> =
                rollup.iter().map(|name| guard.rollup.get(name)).collect();

            if let (true, Some(rollup_counters)) = (scoped_ready, rollup_counters) {
                if let Some(counter) = scoped_counter {
                    bump(counter, delta);
                }
                for counter in rollup_counters {
                    bump(counter, delta);
                }
                return Ok(());
            }
        }

        // First sighting of at least one name: insert under the write lock and
        // increment there, which is just as atomic for readers.
        let mut guard = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if guard.state == AggregatorState::Flushed {
            return Err(TelemetryError::invalid_state(&self.owner));
        }
        if let Some((name, path)) = scoped {
            trace!(metric = %name, scope = %path, "new scoped metric");
            bump(
                guard
                    .scoped
                    .entry((name.clone(), path.clone()))
                    .or_default(),
                delta,
            );
        }
        for name in rollup {
            bump(guard.rollup.entry(name.clone()).or_default(), delta);
        }
        Ok(())
    }

    /// Records one datastore event: its rollup ladder for `kind` plus the scoped
    /// operation metric under `path`, in one atomic step.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] once the aggregator has flushed.
    pub fn record_event(
        &self,
        event: &DatastoreEvent,
        kind: TransactionKind,
        path: &CallPath,
        delta: u64,
    ) -> TelemetryResult<()> {
        let rungs = ladder(event, kind);
        self.record(Some((&operation_metric(event), path)), &rungs, delta)
    }

    /// Returns a consistent copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricTable {
        let guard = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = &guard.flushed {
            return table.clone();
        }
        MetricTable::from_counters(&guard)
    }

    /// Freezes the aggregator and returns the final table.
    ///
    /// Flushing twice returns the same table.
    pub fn flush(&self) -> MetricTable {
        let mut guard = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = &guard.flushed {
            return table.clone();
        }
        let table = MetricTable::from_counters(&guard);
        guard.state = AggregatorState::Flushed;
        guard.scoped.clear();
        guard.rollup.clear();
        guard.flushed = Some(table.clone());
        table
    }
}

fn bump(counter: &AtomicU64, delta: u64) {
    // The closure never returns `None`, so the update cannot fail.
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_add(delta))
    });
}

/// Immutable view of aggregated counters.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MetricTable {
    scoped: BTreeMap<CallPath, BTreeMap<MetricName, u64>>,
    rollup: BTreeMap<MetricName, u64>,
}

impl MetricTable {
    fn from_counters(counters: &Counters) -> Self {
        let mut scoped: BTreeMap<CallPath, BTreeMap<MetricName, u64>> = BTreeMap::new();
        for ((name, path), counter) in &counters.scoped {
            scoped
                .entry(path.clone())
                .or_default()
                .insert(name.clone(), counter.load(Ordering::Acquire));
        }
        let rollup = counters
            .rollup
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Acquire)))
            .collect();
        Self { scoped, rollup }
    }

    /// Returns the scoped count for `name` under `path`, if recorded.
    #[must_use]
    pub fn scoped(&self, name: &MetricName, path: &CallPath) -> Option<u64> {
        self.scoped.get(path).and_then(|m| m.get(name)).copied()
    }

    /// Returns the rollup count for `name`, if recorded.
    #[must_use]
    pub fn rollup(&self, name: &MetricName) -> Option<u64> {
        self.rollup.get(name).copied()
    }

    /// Iterates over every scoped entry as `(path, name, count)`.
    pub fn scoped_entries(&self) -> impl Iterator<Item = (&CallPath, &MetricName, u64)> {
        self.scoped
            .iter()
            .flat_map(|(path, names)| names.iter().map(move |(name, count)| (path, name, *count)))
    }

    /// Iterates over every rollup entry.
    pub fn rollup_entries(&self) -> impl Iterator<Item = (&MetricName, u64)> {
        self.rollup.iter().map(|(name, count)| (name, *count))
    }

    /// Returns `true` when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scoped.is_empty() && self.rollup.is_empty()
    }

    /// Adds every counter of `other` into `self`, saturating at `u64::MAX`.
    pub fn merge(&mut self, other: &Self) {
        for (path, names) in &other.scoped {
            let target = self.scoped.entry(path.clone()).or_default();
            for (name, count) in names {
                let slot = target.entry(name.clone()).or_default();
                *slot = slot.saturating_add(*count);
            }
        }
        for (name, count) in &other.rollup {
            let slot = self.rollup.entry(name.clone()).or_default();
            *slot = slot.saturating_add(*count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn name(s: &str) -> MetricName {
        MetricName::new(s).unwrap()
    }

    #[test]
    fn repeated_records_accumulate() {
        let aggregator = MetricAggregator::new("txn");
        let path = CallPath::background("txn").unwrap();
        let metric = name("Datastore/operation/Valkey/get");
        for _ in 0..7 {
            aggregator.record_scoped(&metric, &path, 1).unwrap();
        }
        assert_eq!(aggregator.snapshot().scoped(&metric, &path), Some(7));
    }

    #[test]
    fn record_event_writes_ladder_and_scoped_operation() {
        use apm_primitives::{InstanceResolver, Operation, Product};

        let aggregator = MetricAggregator::new("txn");
        let path = CallPath::web("txn").unwrap();
        let event = DatastoreEvent::new(
            Product::new("Valkey").unwrap(),
            Operation::new("get").unwrap(),
        )
        .with_instance(InstanceResolver::new("box").resolve("::1", 6379));
        aggregator
            .record_event(&event, TransactionKind::Web, &path, 2)
            .unwrap();

        let table = aggregator.snapshot();
        let op = name("Datastore/operation/Valkey/get");
        assert_eq!(table.scoped(&op, &path), Some(2));
        assert_eq!(table.rollup(&name("Datastore/allWeb")), Some(2));
        assert_eq!(table.rollup(&name("Datastore/instance/Valkey/box/6379")), Some(2));
        assert_eq!(table.rollup_entries().count(), 6);
    }

    #[test]
    fn merge_sums_and_saturates() {
        let path = CallPath::background("txn").unwrap();
        let op = name("Datastore/operation/Valkey/get");
        let all = name("Datastore/all");

        let first = MetricAggregator::new("a");
        first.record(Some((&op, &path)), &[all.clone()], 2).unwrap();
        let second = MetricAggregator::new("b");
        second.record(Some((&op, &path)), &[all.clone()], u64::MAX).unwrap();
        second.record_rollup(&[name("Datastore/Valkey/all")], 1).unwrap();

        let mut table = first.flush();
        table.merge(&second.flush());
        assert_eq!(table.rollup(&all), Some(u64::MAX));
        assert_eq!(table.scoped(&op, &path), Some(u64::MAX));
        assert_eq!(table.rollup(&name("Datastore/Valkey/all")), Some(1));
    }

    #[test]
    fn addition_saturates() {
        let aggregator = MetricAggregator::new("txn");
        let metric = name("Datastore/all");
        aggregator.record_rollup(&[metric.clone()], u64::MAX - 1).unwrap();
        aggregator.record_rollup(&[metric.clone()], 5).unwrap();
        assert_eq!(aggregator.snapshot().rollup(&metric), Some(u64::MAX));
    }

    #[test]
    fn record_after_flush_is_rejected_and_state_is_unchanged() {
        let aggregator = MetricAggregator::new("txn");
        let metric = name("Datastore/all");
        aggregator.record_rollup(&[metric.clone()], 2).unwrap();
        let table = aggregator.flush();
        assert_eq!(aggregator.state(), AggregatorState::Flushed);

        let err = aggregator
            .record_rollup(&[metric.clone()], 1)
            .expect_err("flushed aggregator must reject records");
        assert!(matches!(err, TelemetryError::InvalidState { .. }));
        assert_eq!(aggregator.flush(), table);
        assert_eq!(aggregator.snapshot().rollup(&metric), Some(2));
    }

    #[test]
    fn parallel_records_are_not_lost() {
        let aggregator = Arc::new(MetricAggregator::new("txn"));
        let path = CallPath::background("txn").unwrap();
        let names = vec![name("Datastore/all"), name("Datastore/allOther")];

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                let names = names.clone();
                let path = path.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        aggregator
                            .record(Some((&names[0], &path)), &names, 1)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let table = aggregator.flush();
        assert_eq!(table.rollup(&names[0]), Some(4000));
        assert_eq!(table.rollup(&names[1]), Some(4000));
        assert_eq!(table.scoped(&names[0], &path), Some(4000));
    }

    #[test]
    fn readers_never_see_partial_ladders() {
        let aggregator = Arc::new(MetricAggregator::new("txn"));
        let names: Vec<MetricName> = ["a/1", "a/2", "a/3", "a/4", "a/5", "a/6"]
            .into_iter()
            .map(name)
            .collect();
        aggregator.record_rollup(&names, 0).unwrap();

        let writer = {
            let aggregator = Arc::clone(&aggregator);
            let names = names.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    aggregator.record_rollup(&names, 1).unwrap();
                }
            })
        };
        for _ in 0..200 {
            let table = aggregator.snapshot();
            let first = table.rollup(&names[0]);
            assert!(names.iter().all(|n| table.rollup(n) == first));
        }
        writer.join().unwrap();
    }

    #[test]
    fn table_serializes_as_nested_maps() {
        let aggregator = MetricAggregator::new("txn");
        let path = CallPath::background("txn").unwrap();
        aggregator
            .record(Some((&name("x/y"), &path)), &[name("x/y")], 1)
            .unwrap();
        let json = serde_json::to_value(aggregator.flush()).unwrap();
        assert_eq!(json["rollup"]["x/y"], 1);
        assert_eq!(json["scoped"]["OtherTransaction/Function/txn"]["x/y"], 1);
    }
}
