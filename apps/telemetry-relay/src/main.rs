use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use telemetry_relay::{
    config::{Cli, RelayConfig},
    consumer::{connect_bus, start_consumers},
    relay::Relay,
    routes::{build_router, AppState},
    schema::{load_seed, subscription_topics, ChannelMap},
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;

    info!(
        listen_addr = %config.listen_addr,
        nats_url = config.nats_url.as_deref().unwrap_or("disabled"),
        heartbeat_secs = config.heartbeat.as_secs(),
        sink_buffer = config.sink_buffer,
        wire_quarter_c = config.wire_quarter_c,
        "starting telemetry relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let seed = load_seed(config.seed_path.as_deref()).context("failed to load seed snapshot")?;
    info!(leaves = seed.leaf_count(), "seed snapshot loaded");
    let relay = Arc::new(Relay::new(seed, ChannelMap::dashboard(), config.sink_buffer));
    let shutdown = CancellationToken::new();

    let bus = connect_bus(config.nats_url.as_deref()).await;
    let consumers = match &bus {
        Some(bus) => {
            let topics = subscription_topics(config.wire_quarter_c);
            Some(start_consumers(bus.as_ref(), Arc::clone(&relay), &topics, shutdown.clone()).await)
        }
        None => None,
    };

    let state = Arc::new(AppState {
        relay,
        heartbeat: config.heartbeat,
        shutdown: shutdown.clone(),
        metrics,
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let until_cancelled = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { until_cancelled.cancelled().await })
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "server stopped; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;

    if let Some(consumers) = consumers {
        consumers.abort();
        consumers.join().await;
    }
    drop(bus);
    info!("graceful shutdown complete");
    Ok(())
}
