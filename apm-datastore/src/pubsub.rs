//! Publish/subscribe handle built on a subscriber connection.

use bytes::Bytes;
use futures::Stream;
use futures::stream;

use crate::transport::SubscriberConnection;
use crate::DatastoreResult;

/// Kind of message pushed to a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Confirmation of `SUBSCRIBE`.
    Subscribe,
    /// Confirmation of `PSUBSCRIBE`.
    PSubscribe,
    /// Message delivered through an exact channel subscription.
    Message,
    /// Message delivered through a pattern subscription.
    PMessage,
}

/// Message pushed to a subscriber connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Message kind.
    pub kind: MessageKind,
    /// Channel the message was published on (or subscribed to).
    pub channel: String,
    /// Matching pattern for pattern deliveries.
    pub pattern: Option<String>,
    /// Payload; the subscription count for confirmations.
    pub data: Bytes,
}

impl PubSubMessage {
    /// Returns `true` for subscription confirmations.
    #[must_use]
    pub const fn is_subscription(&self) -> bool {
        matches!(self.kind, MessageKind::Subscribe | MessageKind::PSubscribe)
    }
}

/// Subscriber handle returned by [`Client::pubsub`](crate::Client::pubsub).
///
/// Subscription traffic is not instrumented.
pub struct PubSub {
    conn: Box<dyn SubscriberConnection>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub").finish_non_exhaustive()
    }
}

impl PubSub {
    pub(crate) fn new(conn: Box<dyn SubscriberConnection>) -> Self {
        Self { conn }
    }

    /// Subscribes to exact channels.
    ///
    /// # Errors
    ///
    /// Propagates connection failures.
    pub async fn subscribe<S: AsRef<str>>(&mut self, channels: &[S]) -> DatastoreResult<()> {
        let channels: Vec<String> = channels.iter().map(|c| c.as_ref().to_owned()).collect();
        self.conn.subscribe(&channels).await
    }

    /// Subscribes to glob patterns.
    ///
    /// # Errors
    ///
    /// Propagates connection failures.
    pub async fn psubscribe<S: AsRef<str>>(&mut self, patterns: &[S]) -> DatastoreResult<()> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.as_ref().to_owned()).collect();
        self.conn.psubscribe(&patterns).await
    }

    /// Waits for the next message, optionally skipping subscription confirmations.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn get_message(&mut self, ignore_subscribe_messages: bool) -> Option<PubSubMessage> {
        loop {
            let message = self.conn.next_message().await?;
            if ignore_subscribe_messages && message.is_subscription() {
                continue;
            }
            return Some(message);
        }
    }

    /// Converts the handle into a stream of messages.
    pub fn into_stream(
        self,
        ignore_subscribe_messages: bool,
    ) -> impl Stream<Item = PubSubMessage> + Send {
        stream::unfold(self, move |mut pubsub| async move {
            let message = pubsub.get_message(ignore_subscribe_messages).await?;
            Some((message, pubsub))
        })
    }

    /// Unsubscribes from everything and closes the connection.
    pub async fn close(mut self) {
        self.conn.close().await;
    }
}
