//! Wires router, store and hub together.
//!
//! Ordering contract: `apply` pushes to the hub while the store's write lock
//! is held, and `attach` registers its sink while the read lock is held.
//! An update is therefore either already in the snapshot a new viewer
//! receives, or queued on that viewer's sink. Lock order is always
//! store then hub.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use metrics::counter;
use serde::Serialize;

use crate::{
    hub::{BroadcastHub, FanoutReport, HubStats, Sink},
    router::{RouteError, TopicRouter},
    schema::ChannelMap,
    snapshot::{Snapshot, SnapshotStore, StoreError},
    update::Update,
};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            IngestError::Route(err) => err.metric_label(),
            IngestError::Store(StoreError::FieldType(_)) => "field_type",
            IngestError::Store(_) => "unknown_topic",
        }
    }
}

#[derive(Debug)]
pub struct Ingested {
    pub update: Update,
    pub fanout: FanoutReport,
}

/// What a new viewer starts from: the state at registration time and the
/// sink that carries everything committed afterwards.
#[derive(Debug)]
pub struct Attachment {
    pub snapshot: Snapshot,
    pub sink: Sink,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RelayStats {
    #[serde(flatten)]
    pub hub: HubStats,
    pub updates_applied: u64,
}

pub struct Relay {
    store: SnapshotStore,
    hub: Arc<BroadcastHub>,
    router: TopicRouter,
    applied: AtomicU64,
}

impl Relay {
    pub fn new(seed: Snapshot, channels: ChannelMap, sink_buffer: usize) -> Self {
        let router = TopicRouter::new(channels, &seed);
        Self {
            store: SnapshotStore::new(seed),
            hub: Arc::new(BroadcastHub::new(sink_buffer)),
            router,
            applied: AtomicU64::new(0),
        }
    }

    /// Full bus pipeline for one message: route, mutate, fan out.
    pub fn ingest(&self, topic: &str, payload: &[u8]) -> Result<Ingested, IngestError> {
        let update = self.router.route(topic, payload).inspect_err(|err| {
            counter!("relay_ingest_rejected_total", 1, "reason" => err.metric_label());
        })?;
        let fanout = self.apply(&update).map_err(|err| {
            let err = IngestError::from(err);
            counter!("relay_ingest_rejected_total", 1, "reason" => err.metric_label());
            err
        })?;
        Ok(Ingested { update, fanout })
    }

    pub fn apply(&self, update: &Update) -> Result<FanoutReport, StoreError> {
        let fanout = self
            .store
            .apply_then(update, |committed| self.hub.push(committed))?;
        self.applied.fetch_add(1, Ordering::Relaxed);
        counter!(
            "relay_updates_applied_total",
            1,
            "group" => update.path.group().to_string()
        );
        Ok(fanout)
    }

    pub fn attach(&self) -> Attachment {
        let (snapshot, sink) = self.store.read_then(|| self.hub.register());
        Attachment { snapshot, sink }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.read_all()
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            hub: self.hub.stats(),
            updates_applied: self.applied.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::load_seed;

    fn relay(buffer: usize) -> Relay {
        Relay::new(load_seed(None).unwrap(), ChannelMap::dashboard(), buffer)
    }

    #[test]
    fn ingest_mutates_and_broadcasts() {
        let relay = relay(8);
        let mut attachment = relay.attach();

        let ingested = relay.ingest("quarterA.col2.num5", b"77").unwrap();
        assert_eq!(ingested.fanout.delivered, 1);
        assert_eq!(relay.snapshot().int_at("quarterA.col2.num5"), Some(77));

        let received = attachment.sink.try_recv().unwrap();
        assert_eq!(
            serde_json::to_string(&*received).unwrap(),
            r#"{"path":"quarterA.col2.num5","value":77}"#
        );
    }

    #[test]
    fn clamped_value_is_what_gets_stored_and_sent() {
        let relay = relay(8);
        let mut attachment = relay.attach();
        relay.ingest("quarterD.col3", b"250").unwrap();
        assert_eq!(relay.snapshot().int_at("quarterD.col3.current"), Some(99));
        assert_eq!(attachment.sink.try_recv().unwrap().value, 99);
    }

    #[test]
    fn rejected_messages_leave_no_trace() {
        let relay = relay(8);
        let mut attachment = relay.attach();
        let before = relay.snapshot();

        let err = relay.ingest("quarterZ.foo", b"1").unwrap_err();
        assert_eq!(err.metric_label(), "unknown_topic");
        let err = relay.ingest("quarterA.col1.num1", b"not json").unwrap_err();
        assert_eq!(err.metric_label(), "malformed_payload");
        let err = relay.ingest("quarterA.col1.title", b"4").unwrap_err();
        assert_eq!(err.metric_label(), "field_type");

        assert_eq!(relay.snapshot(), before);
        assert!(attachment.sink.try_recv().is_none());
        assert_eq!(relay.stats().updates_applied, 0);

        // Later traffic still flows.
        relay.ingest("quarterA.col1.num1", b"3").unwrap();
        assert_eq!(attachment.sink.try_recv().unwrap().value, 3);
    }

    #[test]
    fn attach_sees_either_snapshot_or_update() {
        let relay = Arc::new(relay(1024));
        let writer = {
            let relay = Arc::clone(&relay);
            std::thread::spawn(move || {
                for value in 0..500 {
                    relay
                        .ingest("quarterA.col1.num1", value.to_string().as_bytes())
                        .unwrap();
                }
            })
        };

        let mut attachments = Vec::new();
        for _ in 0..50 {
            attachments.push(relay.attach());
        }
        writer.join().unwrap();

        for mut attachment in attachments {
            let mut last = attachment.snapshot.int_at("quarterA.col1.num1").unwrap();
            while let Some(update) = attachment.sink.try_recv() {
                // The first queued update follows the snapshot with no gap.
                if last != 45 || update.value != 0 {
                    assert_eq!(update.value, last + 1);
                }
                last = update.value;
            }
            assert_eq!(last, 499);
        }
    }
}
