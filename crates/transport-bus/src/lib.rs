//! Publish/subscribe seam between the relay and whatever carries raw
//! telemetry messages. The relay only ever sees a topic name and the
//! undecoded payload bytes.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[cfg(feature = "nats")]
pub mod nats;

#[cfg(feature = "nats")]
pub use nats::NatsBus;

const LOCAL_TOPIC_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("failed to connect to bus at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// A live subscription to exactly one topic.
///
/// The stream ends when the underlying transport closes the subscription.
pub struct Subscription {
    topic: String,
    messages: BoxStream<'static, BusMessage>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, messages: BoxStream<'static, BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn next(&mut self) -> Option<BusMessage> {
        self.messages.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription>;
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// Simple in-memory bus for tests and bus-less runs.
///
/// Topics are matched exactly; there is no wildcard support. Publishing to a
/// topic nobody listens on succeeds and the message is discarded, the same
/// way a core NATS publish behaves.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_TOPIC_DEPTH).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let receiver = self.sender_for(topic).subscribe();
        let topic_label = topic.to_string();
        let messages = BroadcastStream::new(receiver).filter_map(move |item| {
            let topic_label = topic_label.clone();
            async move {
                match item {
                    Ok(message) => Some(message),
                    Err(err) => {
                        tracing::warn!(topic = %topic_label, error = %err, "local bus subscriber lagged");
                        None
                    }
                }
            }
        });
        Ok(Subscription::new(topic, messages.boxed()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        // No receivers is not an error for a fire-and-forget bus.
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
