//! Rollup ladder expansion for datastore events.

use std::fmt::{self, Display, Formatter};

use apm_primitives::{InstanceId, MetricName, Operation, Product};
use serde::{Deserialize, Serialize};

const DATASTORE: &str = "Datastore";

/// Distinguishes request-driven from task-driven transactions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Foreground, request-driven work.
    Web,
    /// Background, task-driven work.
    Other,
}

impl TransactionKind {
    /// Maps the `background` flag used by transaction APIs to a kind.
    #[must_use]
    pub const fn from_background(background: bool) -> Self {
        if background { Self::Other } else { Self::Web }
    }

    /// Returns `true` for background transactions.
    #[must_use]
    pub const fn is_background(self) -> bool {
        matches!(self, Self::Other)
    }

    /// Rollup suffix selected by this kind (`allWeb` or `allOther`).
    #[must_use]
    pub const fn rollup_suffix(self) -> &'static str {
        match self {
            Self::Web => "allWeb",
            Self::Other => "allOther",
        }
    }
}

impl Display for TransactionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Web => "web",
            Self::Other => "other",
        })
    }
}

/// One raw datastore operation as seen by the instrumentation layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatastoreEvent {
    product: Product,
    operation: Operation,
    instance: Option<InstanceId>,
}

impl DatastoreEvent {
    /// Creates an event for `operation` against `product`.
    #[must_use]
    pub fn new(product: Product, operation: Operation) -> Self {
        Self {
            product,
            operation,
            instance: None,
        }
    }

    /// Attaches the instance the operation was sent to.
    #[must_use]
    pub fn with_instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Drops the instance, e.g. when instance reporting is disabled.
    #[must_use]
    pub fn without_instance(mut self) -> Self {
        self.instance = None;
        self
    }

    /// Returns the datastore product.
    #[must_use]
    pub fn product(&self) -> &Product {
        &self.product
    }

    /// Returns the operation name.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Returns the instance, if known.
    #[must_use]
    pub fn instance(&self) -> Option<&InstanceId> {
        self.instance.as_ref()
    }
}

/// Scoped metric name for an event: `Datastore/operation/<product>/<operation>`.
#[must_use]
pub fn operation_metric(event: &DatastoreEvent) -> MetricName {
    MetricName::root(DATASTORE)
        .child("operation")
        .child(&event.product)
        .child(&event.operation)
}

/// Expands one event into every rollup name it increments.
///
/// The ladder is `Datastore/all`, `Datastore/<suffix>`, `Datastore/<product>/all`,
/// `Datastore/<product>/<suffix>`, the operation metric, and, when the event
/// carries an instance, `Datastore/instance/<product>/<host>/<port>`.
#[must_use]
pub fn ladder(event: &DatastoreEvent, kind: TransactionKind) -> Vec<MetricName> {
    let root = MetricName::root(DATASTORE);
    let product = root.child(&event.product);
    let mut names = Vec::with_capacity(6);
    names.push(root.child("all"));
    names.push(root.child(kind.rollup_suffix()));
    names.push(product.child("all"));
    names.push(product.child(kind.rollup_suffix()));
    names.push(operation_metric(event));
    if let Some(instance) = &event.instance {
        names.push(root.child("instance").child(&event.product).child(instance));
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_primitives::InstanceResolver;

    fn event() -> DatastoreEvent {
        DatastoreEvent::new(
            Product::new("Valkey").unwrap(),
            Operation::new("publish").unwrap(),
        )
        .with_instance(InstanceResolver::new("box").resolve("127.0.0.1", 6379))
    }

    #[test]
    fn background_ladder_has_six_rungs() {
        let names: Vec<String> = ladder(&event(), TransactionKind::Other)
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            names,
            vec![
                "Datastore/all",
                "Datastore/allOther",
                "Datastore/Valkey/all",
                "Datastore/Valkey/allOther",
                "Datastore/operation/Valkey/publish",
                "Datastore/instance/Valkey/box/6379",
            ]
        );
    }

    #[test]
    fn web_ladder_uses_all_web() {
        let names = ladder(&event(), TransactionKind::Web);
        assert_eq!(names[1].as_str(), "Datastore/allWeb");
        assert_eq!(names[3].as_str(), "Datastore/Valkey/allWeb");
    }

    #[test]
    fn ladder_without_instance_skips_instance_rung() {
        let names = ladder(&event().without_instance(), TransactionKind::Other);
        assert_eq!(names.len(), 5);
        assert!(names.iter().all(|n| !n.as_str().contains("instance")));
    }
}
