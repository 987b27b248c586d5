use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "telemetry-relay";

#[derive(Clone, Copy)]
enum MetricKind {
    Counter,
    Gauge,
}

const RELAY_METRICS: &[(&str, MetricKind, &str)] = &[
    ("relay_updates_applied_total", MetricKind::Counter, "Updates committed to the snapshot, by group"),
    ("relay_ingest_rejected_total", MetricKind::Counter, "Bus messages rejected before reaching the snapshot, by reason"),
    ("relay_fanout_delivered_total", MetricKind::Counter, "Updates queued on a viewer sink"),
    ("relay_fanout_dropped_total", MetricKind::Counter, "Updates lost to a full viewer sink"),
    ("relay_sinks_evicted_total", MetricKind::Counter, "Sinks removed because their viewer had gone"),
    ("relay_sinks_active", MetricKind::Gauge, "Viewer sinks currently registered with the hub"),
    ("relay_sessions_total", MetricKind::Counter, "Viewer sessions opened"),
    ("relay_sessions_closed_total", MetricKind::Counter, "Viewer sessions closed, by reason"),
    ("relay_heartbeats_sent_total", MetricKind::Counter, "Keepalive comments sent to idle viewers"),
];

fn describe_relay_metrics() {
    for &(name, kind, help) in RELAY_METRICS {
        match kind {
            MetricKind::Counter => describe_counter!(name, help),
            MetricKind::Gauge => describe_gauge!(name, help),
        }
    }
}

/// Holds the metrics recorder handle and, when enabled, the span exporter.
/// Keep it alive for the lifetime of the process.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_relay_metrics();

        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let mut tracer_provider = None;

        if env_truthy("RELAY_OTEL_STDOUT") {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                        .build(),
                )
                .build();
            let tracer = provider.tracer(SERVICE_NAME);

            global::set_tracer_provider(provider.clone());
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            tracer_provider = Some(provider);
            info!("OpenTelemetry stdout exporter enabled (RELAY_OTEL_STDOUT=1)");
        } else {
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

pub fn env_truthy(key: &str) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
