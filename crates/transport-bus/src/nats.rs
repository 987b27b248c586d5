//! Core NATS transport (no JetStream). Each `subscribe` opens one plain
//! subscription on the connection; payloads are forwarded untouched.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;

use crate::{Bus, BusError, BusMessage, BusResult, Subscription};

#[derive(Clone, Debug)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|err| BusError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub async fn flush(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|err| BusError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        let messages = subscriber.map(|message| BusMessage {
            topic: message.subject.to_string(),
            payload: message.payload,
        });
        Ok(Subscription::new(topic, messages.boxed()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}
