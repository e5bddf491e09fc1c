//! Background reader draining a subscription into an ordered log.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use apm_datastore::{DatastoreResult, PubSub};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::delivery::{DeliveryError, DeliveryResult, DeliverySignal, DeliveryWaiter};

/// Payload that tells a reader to stop.
pub const DEFAULT_SENTINEL: &str = "NOPE";

/// Ordered record of received payloads, shareable between tasks.
#[derive(Debug, Clone, Default)]
pub struct ReceiptLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ReceiptLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payload.
    pub fn push(&self, payload: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.into());
    }

    /// Copies the current contents in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of received payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when nothing has been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns a task that pulls data messages from `pubsub`, appends each decoded
/// payload to `log`, then sets `signal`. The task closes the subscription and
/// exits after appending `sentinel`.
///
/// The task resolves to [`DeliveryError::Decode`] for a non UTF-8 payload and
/// to [`DeliveryError::Closed`] if the subscription ends before the sentinel.
pub fn spawn_reader(
    mut pubsub: PubSub,
    signal: DeliverySignal,
    log: ReceiptLog,
    sentinel: impl Into<String>,
) -> JoinHandle<DeliveryResult<()>> {
    let sentinel = sentinel.into();
    tokio::spawn(async move {
        loop {
            let Some(message) = pubsub.get_message(true).await else {
                debug!("subscription ended before sentinel");
                return Err(DeliveryError::Closed);
            };
            let text = std::str::from_utf8(&message.data).map_err(|source| {
                DeliveryError::Decode {
                    channel: message.channel.clone(),
                    source,
                }
            })?;
            trace!(channel = %message.channel, payload = text, "delivery received");
            let done = text == sentinel;
            log.push(text);
            signal.set();
            if done {
                break;
            }
        }
        pubsub.close().await;
        Ok(())
    })
}

/// Runs `publish`, then waits for the reader to signal the delivery and clears
/// the event for the next round.
///
/// # Errors
///
/// Returns [`DeliveryError::Datastore`] if publishing fails and
/// [`DeliveryError::Timeout`] if no delivery is signalled within `timeout`.
pub async fn publish_and_confirm<F, T>(
    publish: F,
    waiter: &mut DeliveryWaiter,
    timeout: Duration,
) -> DeliveryResult<T>
where
    F: Future<Output = DatastoreResult<T>>,
{
    let output = publish.await?;
    waiter.wait_timeout(timeout).await?;
    waiter.clear();
    Ok(output)
}
