use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;

use crate::{hub::DEFAULT_SINK_BUFFER, session::DEFAULT_HEARTBEAT};

#[derive(Debug, Parser)]
#[command(
    name = "telemetry-relay",
    author,
    version,
    about = "Relays bus telemetry into a live snapshot and streams changes to viewers over SSE"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// NATS server the telemetry topics are published on.
    #[arg(long, env = "RELAY_NATS_URL", default_value = "nats://nats:4222")]
    pub nats_url: String,

    /// Serve the seed snapshot without connecting to the bus.
    #[arg(long, env = "RELAY_DISABLE_BUS", default_value_t = false)]
    pub disable_bus: bool,

    /// Idle interval after which a viewer receives a keepalive comment.
    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value_t = DEFAULT_HEARTBEAT.as_secs())]
    pub heartbeat_secs: u64,

    /// Updates buffered per viewer before further updates are dropped for it.
    #[arg(long, env = "RELAY_SINK_BUFFER", default_value_t = DEFAULT_SINK_BUFFER)]
    pub sink_buffer: usize,

    /// Also subscribe to the quarterC wait-time and wasted-minutes topics.
    #[arg(long, env = "RELAY_WIRE_QUARTER_C", default_value_t = false)]
    pub wire_quarter_c: bool,

    /// JSON seed document replacing the built-in dashboard schema.
    #[arg(long, env = "RELAY_SEED_PATH")]
    pub seed_path: Option<PathBuf>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub nats_url: Option<String>,
    pub heartbeat: Duration,
    pub sink_buffer: usize,
    pub wire_quarter_c: bool,
    pub seed_path: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.heartbeat_secs > 0, "heartbeat interval must be greater than zero");
        ensure!(cli.sink_buffer > 0, "sink buffer must hold at least one update");

        let nats_url = Some(cli.nats_url.trim().to_string())
            .filter(|url| !cli.disable_bus && !url.is_empty());

        Ok(RelayConfig {
            listen_addr,
            nats_url,
            heartbeat: Duration::from_secs(cli.heartbeat_secs),
            sink_buffer: cli.sink_buffer,
            wire_quarter_c: cli.wire_quarter_c,
            seed_path: cli.seed_path,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
