//! Compares a finished transaction against expected metric counts.

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

use apm_primitives::MetricName;
use serde::Serialize;
use thiserror::Error;

use crate::ladder::TransactionKind;
use crate::transaction::TransactionSummary;
use crate::TelemetryResult;

/// Which hierarchy a metric expectation targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricScope {
    /// Scoped to the transaction's call path.
    Scoped,
    /// Rolled up independent of call path.
    Rollup,
}

impl Display for MetricScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scoped => "scoped",
            Self::Rollup => "rollup",
        })
    }
}

/// Expected value for one metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedCount {
    /// The metric must have exactly this count.
    Exactly(u64),
    /// The metric must not have been recorded at all.
    Absent,
}

/// Ordered table of expected scoped and rollup counts for one transaction.
#[derive(Clone, Debug, Serialize)]
pub struct ExpectedMetrics {
    transaction_name: Option<String>,
    background: bool,
    scoped: Vec<(MetricName, ExpectedCount)>,
    rollup: Vec<(MetricName, ExpectedCount)>,
    strict: bool,
}

impl ExpectedMetrics {
    /// Starts an expectation for a transaction of the given kind.
    ///
    /// When `transaction_name` is `Some`, the finished transaction's name must match.
    #[must_use]
    pub fn new(transaction_name: Option<&str>, background: bool) -> Self {
        Self {
            transaction_name: transaction_name.map(str::to_owned),
            background,
            scoped: Vec::new(),
            rollup: Vec::new(),
            strict: false,
        }
    }

    /// Expects `count` for a scoped metric.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`](crate::TelemetryError::InvalidName)
    /// for a malformed name.
    pub fn scoped(mut self, name: &str, count: u64) -> TelemetryResult<Self> {
        self.scoped
            .push((MetricName::new(name)?, ExpectedCount::Exactly(count)));
        Ok(self)
    }

    /// Expects `count` for a rollup metric.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`](crate::TelemetryError::InvalidName)
    /// for a malformed name.
    pub fn rollup(mut self, name: &str, count: u64) -> TelemetryResult<Self> {
        self.rollup
            .push((MetricName::new(name)?, ExpectedCount::Exactly(count)));
        Ok(self)
    }

    /// Expects a scoped metric to be absent.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`](crate::TelemetryError::InvalidName)
    /// for a malformed name.
    pub fn scoped_absent(mut self, name: &str) -> TelemetryResult<Self> {
        self.scoped.push((MetricName::new(name)?, ExpectedCount::Absent));
        Ok(self)
    }

    /// Expects a rollup metric to be absent.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`](crate::TelemetryError::InvalidName)
    /// for a malformed name.
    pub fn rollup_absent(mut self, name: &str) -> TelemetryResult<Self> {
        self.rollup.push((MetricName::new(name)?, ExpectedCount::Absent));
        Ok(self)
    }

    /// Adds every `(name, count)` pair as a scoped expectation.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`](crate::TelemetryError::InvalidName)
    /// for a malformed name.
    pub fn with_scoped<'a, I>(self, pairs: I) -> TelemetryResult<Self>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        pairs
            .into_iter()
            .try_fold(self, |acc, (name, count)| acc.scoped(name, count))
    }

    /// Adds every `(name, count)` pair as a rollup expectation.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidName`](crate::TelemetryError::InvalidName)
    /// for a malformed name.
    pub fn with_rollup<'a, I>(self, pairs: I) -> TelemetryResult<Self>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        pairs
            .into_iter()
            .try_fold(self, |acc, (name, count)| acc.rollup(name, count))
    }

    /// Also report recorded metrics that have no expectation.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Returns the expected transaction kind.
    #[must_use]
    pub const fn kind(&self) -> TransactionKind {
        TransactionKind::from_background(self.background)
    }
}

/// One difference between expected and actual state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mismatch {
    /// Count differs; missing metrics report `actual` as 0.
    Count {
        /// Hierarchy of the metric.
        scope: MetricScope,
        /// Metric name.
        name: MetricName,
        /// Expected count.
        expected: u64,
        /// Recorded count.
        actual: u64,
    },
    /// Metric expected to be absent was recorded.
    Present {
        /// Hierarchy of the metric.
        scope: MetricScope,
        /// Metric name.
        name: MetricName,
        /// Recorded count.
        actual: u64,
    },
    /// Strict mode: recorded metric with no expectation.
    Unexpected {
        /// Hierarchy of the metric.
        scope: MetricScope,
        /// Metric name.
        name: MetricName,
        /// Recorded count.
        actual: u64,
    },
    /// Transaction name differs.
    TransactionName {
        /// Expected name.
        expected: String,
        /// Actual name.
        actual: String,
    },
    /// Foreground/background kind differs.
    TransactionKind {
        /// Expected kind.
        expected: TransactionKind,
        /// Actual kind.
        actual: TransactionKind,
    },
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count {
                scope,
                name,
                expected,
                actual,
            } => write!(f, "{scope} {name}: expected {expected}, got {actual}"),
            Self::Present { scope, name, actual } => {
                write!(f, "{scope} {name}: expected absent, got {actual}")
            }
            Self::Unexpected { scope, name, actual } => {
                write!(f, "{scope} {name}: unexpected metric with count {actual}")
            }
            Self::TransactionName { expected, actual } => {
                write!(f, "transaction name: expected `{expected}`, got `{actual}`")
            }
            Self::TransactionKind { expected, actual } => {
                write!(f, "transaction kind: expected {expected}, got {actual}")
            }
        }
    }
}

/// Every mismatch found by [`validate`]; empty means success.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ValidationReport {
    mismatches: Vec<Mismatch>,
}

impl ValidationReport {
    /// Returns `true` when no mismatch was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Returns the mismatches in the order they were detected.
    #[must_use]
    pub fn mismatches(&self) -> &[Mismatch] {
        &self.mismatches
    }

    /// Converts a non-empty report into an error.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationMismatchError`] carrying this report when it is not empty.
    pub fn into_result(self) -> Result<(), ValidationMismatchError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ValidationMismatchError { report: self })
        }
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for mismatch in &self.mismatches {
            writeln!(f, "  {mismatch}")?;
        }
        Ok(())
    }
}

/// Raised when a transaction does not match its expected metrics.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{} metric mismatch(es):\n{report}", .report.mismatches.len())]
pub struct ValidationMismatchError {
    /// Full per-metric diff.
    pub report: ValidationReport,
}

/// Diffs `actual` against `expected`, collecting every mismatch.
#[must_use]
pub fn validate(actual: &TransactionSummary, expected: &ExpectedMetrics) -> ValidationReport {
    let mut mismatches = Vec::new();

    if let Some(name) = &expected.transaction_name {
        if *name != actual.name {
            mismatches.push(Mismatch::TransactionName {
                expected: name.clone(),
                actual: actual.name.clone(),
            });
        }
    }
    if expected.kind() != actual.kind {
        mismatches.push(Mismatch::TransactionKind {
            expected: expected.kind(),
            actual: actual.kind,
        });
    }

    for (name, want) in &expected.scoped {
        let got = actual.metrics.scoped(name, &actual.call_path);
        compare(&mut mismatches, MetricScope::Scoped, name, *want, got);
    }
    for (name, want) in &expected.rollup {
        let got = actual.metrics.rollup(name);
        compare(&mut mismatches, MetricScope::Rollup, name, *want, got);
    }

    if expected.strict {
        let known: HashSet<&MetricName> = expected.scoped.iter().map(|(n, _)| n).collect();
        for (_, name, count) in actual.metrics.scoped_entries() {
            if !known.contains(name) {
                mismatches.push(Mismatch::Unexpected {
                    scope: MetricScope::Scoped,
                    name: name.clone(),
                    actual: count,
                });
            }
        }
        let known: HashSet<&MetricName> = expected.rollup.iter().map(|(n, _)| n).collect();
        for (name, count) in actual.metrics.rollup_entries() {
            if !known.contains(name) {
                mismatches.push(Mismatch::Unexpected {
                    scope: MetricScope::Rollup,
                    name: name.clone(),
                    actual: count,
                });
            }
        }
    }

    ValidationReport { mismatches }
}

fn compare(
    out: &mut Vec<Mismatch>,
    scope: MetricScope,
    name: &MetricName,
    want: ExpectedCount,
    got: Option<u64>,
) {
    match (want, got) {
        (ExpectedCount::Exactly(expected), got) => {
            let actual = got.unwrap_or(0);
            if actual != expected {
                out.push(Mismatch::Count {
                    scope,
                    name: name.clone(),
                    expected,
                    actual,
                });
            }
        }
        (ExpectedCount::Absent, Some(actual)) => out.push(Mismatch::Present {
            scope,
            name: name.clone(),
            actual,
        }),
        (ExpectedCount::Absent, None) => {}
    }
}
