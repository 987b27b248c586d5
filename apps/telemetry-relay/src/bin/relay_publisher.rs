//! Synthetic load for the relay: publishes random readings to every
//! counter and percentage topic, then idles for a random interval.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use clap::Parser;
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transport_bus::{Bus, NatsBus};

use telemetry_relay::schema::subscription_topics;

#[derive(Debug, Parser)]
#[command(name = "relay-publisher", author, version, about = "Publishes synthetic telemetry for the relay")]
struct Cli {
    #[arg(long, env = "RELAY_NATS_URL", default_value = "nats://nats:4222")]
    nats_url: String,

    /// Shortest pause between batches.
    #[arg(long, default_value_t = 10)]
    min_wait_secs: u64,

    /// Longest pause between batches.
    #[arg(long, default_value_t = 30)]
    max_wait_secs: u64,

    /// Publish a single batch and exit.
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    ensure!(
        cli.min_wait_secs <= cli.max_wait_secs,
        "--min-wait-secs must not exceed --max-wait-secs"
    );

    let bus = NatsBus::connect(&cli.nats_url)
        .await
        .with_context(|| format!("failed to connect to {}", cli.nats_url))?;
    info!(url = %cli.nats_url, "publisher connected");

    let topics = subscription_topics(false);
    loop {
        let published = publish_batch(&bus, &topics).await;
        bus.flush().await.context("failed to flush bus")?;
        info!(published, topics = topics.len(), "batch published");

        if cli.once {
            return Ok(());
        }

        let wait = rand::thread_rng().gen_range(cli.min_wait_secs..=cli.max_wait_secs);
        debug!(wait_secs = wait, "sleeping until next batch");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("publisher stopping");
                return Ok(());
            }
        }
    }
}

async fn publish_batch(bus: &NatsBus, topics: &[String]) -> usize {
    let mut published = 0;
    for topic in topics {
        let value: i64 = rand::thread_rng().gen_range(1..=99);
        match bus.publish(topic, Bytes::from(value.to_string())).await {
            Ok(()) => published += 1,
            Err(err) => warn!(topic = %topic, error = %err, "publish failed"),
        }
    }
    published
}
