//! Per-connection viewer loop.
//!
//! `Connecting -> Handshaking -> Streaming -> Closed`. The session reads the
//! snapshot exactly once (at attach); from then on it only relays what the
//! hub queues on its sink, plus heartbeats when idle.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    hub::Sink,
    relay::{Attachment, Relay},
    snapshot::Snapshot,
    update::Update,
};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum Frame {
    Init(Snapshot),
    Update(Arc<Update>),
    Heartbeat,
}

#[derive(Debug, thiserror::Error)]
#[error("client sink write failed: {0}")]
pub struct WriteError(pub String);

/// Outbound half of one client connection.
#[async_trait]
pub trait FrameWriter: Send + Sync {
    async fn write(&mut self, frame: Frame) -> Result<(), WriteError>;

    /// Resolves once the peer has gone away.
    async fn closed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Server shutdown or the connection's own cancellation signal.
    Cancelled,
    /// The peer hung up between frames.
    Disconnected,
    WriteFailed,
    /// The hub no longer holds this sink.
    Evicted,
    /// The sink's buffer overflowed, so the viewer's copy has a gap. Closing
    /// makes the client reconnect and start over from a fresh `init`.
    Saturated,
}

impl SessionOutcome {
    pub fn metric_label(self) -> &'static str {
        match self {
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Disconnected => "disconnected",
            SessionOutcome::WriteFailed => "write_failed",
            SessionOutcome::Evicted => "evicted",
            SessionOutcome::Saturated => "saturated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub updates_sent: u64,
    pub heartbeats_sent: u64,
    pub dropped: u64,
}

pub struct ClientSession {
    connection_id: Uuid,
    heartbeat: Duration,
    state: SessionState,
    snapshot: Option<Snapshot>,
    sink: Sink,
}

impl ClientSession {
    /// Accepts a client: reads the snapshot and registers with the hub as
    /// one step.
    pub fn open(relay: &Relay, heartbeat: Duration) -> Self {
        let mut session = Self::from_attachment(relay.attach(), heartbeat);
        session.state = SessionState::Handshaking;
        session
    }

    pub fn from_attachment(attachment: Attachment, heartbeat: Duration) -> Self {
        counter!("relay_sessions_total", 1);
        Self {
            connection_id: Uuid::new_v4(),
            heartbeat,
            state: SessionState::Connecting,
            snapshot: Some(attachment.snapshot),
            sink: attachment.sink,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run<W: FrameWriter>(
        mut self,
        writer: &mut W,
        cancel: CancellationToken,
    ) -> SessionReport {
        self.state = SessionState::Handshaking;
        info!(
            connection_id = %self.connection_id,
            sink = %self.sink.id(),
            "viewer attached"
        );

        let mut updates_sent = 0u64;
        let mut heartbeats_sent = 0u64;

        let outcome = self
            .stream(writer, &cancel, &mut updates_sent, &mut heartbeats_sent)
            .await;

        self.state = SessionState::Closed;
        self.sink.deregister();
        let report = SessionReport {
            outcome,
            updates_sent,
            heartbeats_sent,
            dropped: self.sink.dropped(),
        };
        counter!(
            "relay_sessions_closed_total",
            1,
            "reason" => outcome.metric_label()
        );
        info!(
            connection_id = %self.connection_id,
            reason = outcome.metric_label(),
            updates_sent,
            heartbeats_sent,
            dropped = report.dropped,
            "viewer detached"
        );
        report
    }

    async fn stream<W: FrameWriter>(
        &mut self,
        writer: &mut W,
        cancel: &CancellationToken,
        updates_sent: &mut u64,
        heartbeats_sent: &mut u64,
    ) -> SessionOutcome {
        let snapshot = self.snapshot.take().unwrap_or_default();
        if let Err(outcome) = send(writer, Frame::Init(snapshot), cancel).await {
            return outcome;
        }
        self.state = SessionState::Streaming;

        let idle = tokio::time::sleep(self.heartbeat);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionOutcome::Cancelled,
                _ = writer.closed() => return SessionOutcome::Disconnected,
                next = self.sink.recv() => {
                    let Some(update) = next else {
                        return SessionOutcome::Evicted;
                    };
                    if self.sink.dropped() > 0 {
                        return SessionOutcome::Saturated;
                    }
                    if let Err(outcome) = send(writer, Frame::Update(update), cancel).await {
                        return outcome;
                    }
                    *updates_sent += 1;
                }
                _ = &mut idle => {
                    if let Err(outcome) = send(writer, Frame::Heartbeat, cancel).await {
                        return outcome;
                    }
                    *heartbeats_sent += 1;
                    counter!("relay_heartbeats_sent_total", 1);
                    debug!(connection_id = %self.connection_id, "heartbeat sent");
                }
            }
            idle.as_mut().reset(Instant::now() + self.heartbeat);
        }
    }
}

/// Writes one frame unless cancellation fires first. Failed writes are
/// never retried.
async fn send<W: FrameWriter>(
    writer: &mut W,
    frame: Frame,
    cancel: &CancellationToken,
) -> Result<(), SessionOutcome> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionOutcome::Cancelled),
        written = writer.write(frame) => written.map_err(|err| {
            debug!(error = %err, "frame write failed");
            SessionOutcome::WriteFailed
        }),
    }
}
