//! Single-slot delivery event shared by a reader task and a test body.

use std::time::Duration;

use apm_datastore::DatastoreError;
use thiserror::Error;
use tokio::sync::watch;

/// Errors produced while waiting for deliveries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No delivery was signalled within the allowed time.
    #[error("no delivery within {waited:?}")]
    Timeout {
        /// How long the waiter blocked.
        waited: Duration,
    },
    /// A payload was not valid UTF-8.
    #[error("payload on channel {channel} is not valid UTF-8")]
    Decode {
        /// Channel the payload arrived on.
        channel: String,
        /// Decoding failure.
        #[source]
        source: std::str::Utf8Error,
    },
    /// The signalling side went away, or the subscription ended early.
    #[error("delivery channel closed")]
    Closed,
    /// The datastore call being confirmed failed.
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

/// Result alias for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Creates a connected signal/waiter pair. The event starts cleared.
#[must_use]
pub fn delivery_channel() -> (DeliverySignal, DeliveryWaiter) {
    let (tx, rx) = watch::channel(0_u64);
    (DeliverySignal { tx }, DeliveryWaiter { rx, seen: 0 })
}

/// Writer half. Owned by the task that observes deliveries.
#[derive(Debug)]
pub struct DeliverySignal {
    tx: watch::Sender<u64>,
}

impl DeliverySignal {
    /// Marks the event as set, waking the waiter.
    pub fn set(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Reader half. Waiting borrows it mutably, so only one wait can be
/// outstanding.
#[derive(Debug)]
pub struct DeliveryWaiter {
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl DeliveryWaiter {
    /// Returns `true` if the event was set since the last [`clear`](Self::clear).
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.rx.borrow() != self.seen
    }

    /// Waits until the event is set. Returns immediately if it already is.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Closed`] when the signal was dropped without
    /// setting the event.
    pub async fn wait(&mut self) -> DeliveryResult<()> {
        let seen = self.seen;
        self.rx
            .wait_for(|generation| *generation != seen)
            .await
            .map(drop)
            .map_err(|_| DeliveryError::Closed)
    }

    /// Waits for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Timeout`] when the deadline passes first, or
    /// [`DeliveryError::Closed`] as for [`wait`](Self::wait).
    pub async fn wait_timeout(&mut self, timeout: Duration) -> DeliveryResult<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| DeliveryError::Timeout { waited: timeout })?
    }

    /// Resets the event so the next wait blocks until a new delivery.
    pub fn clear(&mut self) {
        self.seen = *self.rx.borrow_and_update();
    }
}
