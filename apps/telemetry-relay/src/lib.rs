//! Bus-to-viewer telemetry relay.
//!
//! Bus messages are routed onto a fixed-schema [`snapshot::Snapshot`],
//! committed to the [`snapshot::SnapshotStore`] and fanned out through the
//! [`hub::BroadcastHub`] to every live [`session::ClientSession`]. New
//! viewers get the full snapshot first, then every change committed after
//! they attached.

pub mod config;
pub mod consumer;
pub mod hub;
pub mod log_throttle;
pub mod relay;
pub mod router;
pub mod routes;
pub mod schema;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod update;
