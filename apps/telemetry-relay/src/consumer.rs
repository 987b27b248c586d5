//! One task per bus subscription. Each task owns its `Subscription` and
//! routes by the topic carried on every message, so no task ever shares
//! topic state with another.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusError, BusMessage, Subscription};

use crate::{
    log_throttle::{should_log_reject, RejectLogKind},
    relay::Relay,
};

pub struct ConsumerSet {
    handles: Vec<JoinHandle<()>>,
    failed: Vec<(String, BusError)>,
}

impl ConsumerSet {
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub fn failed(&self) -> &[(String, BusError)] {
        &self.failed
    }

    /// Waits for every consumer to stop. Call after cancelling the token or
    /// aborting.
    pub async fn join(self) {
        for handle in self.handles {
            match handle.await {
                Err(err) if err.is_panic() => warn!(error = %err, "bus consumer task panicked"),
                _ => {}
            }
        }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Connects to the bus when one is configured. A relay without a bus
/// still serves the seed snapshot, so connection failure is logged rather
/// than returned.
#[cfg(feature = "nats")]
pub async fn connect_bus(nats_url: Option<&str>) -> Option<Box<dyn Bus>> {
    let Some(url) = nats_url else {
        info!("bus disabled; serving seed snapshot only");
        return None;
    };
    match transport_bus::NatsBus::connect(url).await {
        Ok(bus) => {
            info!(url, "connected to bus");
            Some(Box::new(bus))
        }
        Err(err) => {
            warn!(url, error = %err, "bus unavailable; serving seed snapshot without live updates");
            None
        }
    }
}

#[cfg(not(feature = "nats"))]
pub async fn connect_bus(nats_url: Option<&str>) -> Option<Box<dyn Bus>> {
    if nats_url.is_some() {
        warn!("built without the nats feature; serving seed snapshot only");
    }
    None
}

/// Subscribes to every topic up front, then spawns the consumers. A topic
/// that cannot be subscribed is logged and skipped; the rest keep running.
pub async fn start_consumers(
    bus: &dyn Bus,
    relay: Arc<Relay>,
    topics: &[String],
    shutdown: CancellationToken,
) -> ConsumerSet {
    let mut handles = Vec::with_capacity(topics.len());
    let mut failed = Vec::new();

    for topic in topics {
        match bus.subscribe(topic).await {
            Ok(subscription) => {
                debug!(topic = %topic, "subscribed");
                handles.push(tokio::spawn(consume(
                    subscription,
                    Arc::clone(&relay),
                    shutdown.clone(),
                )));
            }
            Err(err) => {
                warn!(topic = %topic, error = %err, "failed to subscribe");
                failed.push((topic.clone(), err));
            }
        }
    }

    info!(
        subscribed = handles.len(),
        failed = failed.len(),
        "bus consumers started"
    );
    ConsumerSet { handles, failed }
}

async fn consume(mut subscription: Subscription, relay: Arc<Relay>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = subscription.next() => match message {
                Some(message) => handle_message(&relay, message),
                None => {
                    warn!(topic = %subscription.topic(), "bus subscription closed");
                    break;
                }
            },
        }
    }
    debug!(topic = %subscription.topic(), "bus consumer stopped");
}

pub fn handle_message(relay: &Relay, message: BusMessage) {
    match relay.ingest(&message.topic, &message.payload) {
        Ok(ingested) => {
            debug!(
                path = %ingested.update.path,
                value = ingested.update.value,
                delivered = ingested.fanout.delivered,
                dropped = ingested.fanout.dropped,
                "update relayed"
            );
        }
        Err(err) => {
            let kind = RejectLogKind::from_label(err.metric_label());
            if should_log_reject(kind, &message.topic) {
                warn!(topic = %message.topic, error = %err, "dropping bus message");
            }
        }
    }
}
