//! Process-wide registry of connected viewers and the lossy fan-out that
//! feeds them.
//!
//! Each sink owns a bounded queue. `push` never waits: a full queue loses
//! that update for that sink only (counted per sink and globally), and a
//! closed queue gets its sink evicted on the spot. A sink that has lost an
//! update is closed by its session the next time it drains.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::update::Update;

pub const DEFAULT_SINK_BUFFER: usize = 64;

/// Stable handle for one registration. The slab index may be reused after
/// removal; the generation never is, so a stale id cannot remove a newer
/// sink that happens to land in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId {
    index: usize,
    generation: u64,
}

impl std::fmt::Display for SinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

pub struct BroadcastHub {
    inner: Mutex<HubInner>,
    buffer: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

struct HubInner {
    slab: Slab<SinkEntry>,
    next_generation: u64,
}

struct SinkEntry {
    generation: u64,
    sender: mpsc::Sender<Arc<Update>>,
    dropped: Arc<AtomicU64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub active_sinks: usize,
    pub delivered_total: u64,
    pub dropped_total: u64,
    pub evicted_total: u64,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                slab: Slab::new(),
                next_generation: 0,
            }),
            buffer: buffer.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Adds a sink to the live set. Dropping the returned [`Sink`]
    /// deregisters it.
    pub fn register(self: &Arc<Self>) -> Sink {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let (id, dropped) = self.insert(sender);
        Sink {
            id,
            receiver,
            dropped,
            hub: Arc::clone(self),
        }
    }

    fn insert(&self, sender: mpsc::Sender<Arc<Update>>) -> (SinkId, Arc<AtomicU64>) {
        let dropped = Arc::new(AtomicU64::new(0));
        let mut guard = self.inner.lock();
        let generation = guard.next_generation;
        guard.next_generation += 1;
        let index = guard.slab.insert(SinkEntry {
            generation,
            sender,
            dropped: Arc::clone(&dropped),
        });
        gauge!("relay_sinks_active", guard.slab.len() as f64);
        (SinkId { index, generation }, dropped)
    }

    /// Removes a sink. Returns `false` when the id was already gone, which
    /// is not an error.
    pub fn deregister(&self, id: SinkId) -> bool {
        let mut guard = self.inner.lock();
        let live = guard
            .slab
            .get(id.index)
            .is_some_and(|entry| entry.generation == id.generation);
        if live {
            guard.slab.remove(id.index);
            gauge!("relay_sinks_active", guard.slab.len() as f64);
        }
        live
    }

    pub fn push(&self, update: &Update) -> FanoutReport {
        let frame = Arc::new(update.clone());
        let mut report = FanoutReport::default();

        let mut guard = self.inner.lock();
        let mut closed = Vec::new();
        for (index, entry) in guard.slab.iter() {
            match entry.sender.try_send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(index),
            }
        }
        for index in closed {
            guard.slab.remove(index);
            report.evicted += 1;
        }
        if report.evicted > 0 {
            gauge!("relay_sinks_active", guard.slab.len() as f64);
        }
        drop(guard);

        self.record(&report);
        report
    }

    fn record(&self, report: &FanoutReport) {
        if report.delivered > 0 {
            self.delivered
                .fetch_add(report.delivered as u64, Ordering::Relaxed);
            counter!("relay_fanout_delivered_total", report.delivered as u64);
        }
        if report.dropped > 0 {
            self.dropped
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            counter!("relay_fanout_dropped_total", report.dropped as u64);
        }
        if report.evicted > 0 {
            self.evicted
                .fetch_add(report.evicted as u64, Ordering::Relaxed);
            counter!("relay_sinks_evicted_total", report.evicted as u64);
        }
    }

    pub fn active_sinks(&self) -> usize {
        self.inner.lock().slab.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_sinks: self.active_sinks(),
            delivered_total: self.delivered.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
            evicted_total: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_BUFFER)
    }
}

/// Receiving end of one registration, held by the client session.
pub struct Sink {
    id: SinkId,
    receiver: mpsc::Receiver<Arc<Update>>,
    dropped: Arc<AtomicU64>,
    hub: Arc<BroadcastHub>,
}

impl Sink {
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Next queued update. `None` once the hub no longer holds this sink.
    pub async fn recv(&mut self) -> Option<Arc<Update>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Update>> {
        self.receiver.try_recv().ok()
    }

    /// Updates lost to a full buffer since registration.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn deregister(&self) -> bool {
        self.hub.deregister(self.id)
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("id", &self.id)
            .field("dropped", &self.dropped())
            .finish()
    }
}
