use std::{convert::Infallible, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::State,
    http::header,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures_util::Stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::{
    relay::Relay,
    session::{ClientSession, Frame, FrameWriter, WriteError},
};

/// Encoded events waiting to be flushed to one HTTP response. The session
/// blocks on this, not the hub, when a viewer's socket is slow.
const SSE_WRITE_DEPTH: usize = 16;

pub struct AppState {
    pub relay: Arc<Relay>,
    pub heartbeat: Duration,
    pub shutdown: CancellationToken,
    pub metrics: PrometheusHandle,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/api/store", get(store_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bridges a client session onto an SSE response body.
struct SseWriter {
    tx: mpsc::Sender<Result<Event, Infallible>>,
}

#[async_trait]
impl FrameWriter for SseWriter {
    async fn write(&mut self, frame: Frame) -> Result<(), WriteError> {
        let event = encode_frame(&frame)?;
        self.tx
            .send(Ok(event))
            .await
            .map_err(|_| WriteError("event stream closed by client".into()))
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

fn encode_frame(frame: &Frame) -> Result<Event, WriteError> {
    let encode = |err: serde_json::Error| WriteError(err.to_string());
    Ok(match frame {
        Frame::Init(snapshot) => Event::default()
            .event("init")
            .data(serde_json::to_string(snapshot).map_err(encode)?),
        Frame::Update(update) => Event::default()
            .event("update")
            .data(serde_json::to_string(update.as_ref()).map_err(encode)?),
        Frame::Heartbeat => Event::default().comment("heartbeat"),
    })
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(SSE_WRITE_DEPTH);
    // Attach before the response is returned so the viewer's snapshot and
    // registration precede any update ingested after this request.
    let session = ClientSession::open(&state.relay, state.heartbeat);
    let cancel = state.shutdown.child_token();
    debug!(connection_id = %session.connection_id(), "sse viewer connected");

    tokio::spawn(async move {
        let mut writer = SseWriter { tx };
        session.run(&mut writer, cancel).await;
    });

    // Keepalives come from the session's idle timer, not axum's.
    Sse::new(ReceiverStream::new(rx))
}

async fn store_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.snapshot())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{load_seed, ChannelMap},
        snapshot::Snapshot,
        update::{ChannelPath, Update},
    };
    use axum::{
        body::{self, Body, Bytes},
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            relay: Arc::new(Relay::new(load_seed(None).unwrap(), ChannelMap::dashboard(), 8)),
            heartbeat: Duration::from_secs(30),
            shutdown: CancellationToken::new(),
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        })
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
    }

    async fn next_chunk(body: &mut Body) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("sse frame in time")
            .expect("stream still open")
            .unwrap();
        let data: Bytes = frame.into_data().unwrap();
        String::from_utf8(data.to_vec()).unwrap()
    }

    fn data_line(chunk: &str) -> &str {
        chunk
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let response = build_router(test_state())
            .oneshot(get_request("/healthz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn store_serves_current_snapshot() {
        let state = test_state();
        let path: ChannelPath = "quarterA.col2.num5".parse().unwrap();
        state.relay.apply(&Update::new(path, 77)).unwrap();

        let response = build_router(Arc::clone(&state))
            .oneshot(get_request("/api/store"))
            .await
            .unwrap();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let served: Snapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(served, state.relay.snapshot());
        assert_eq!(served.int_at("quarterA.col2.num5"), Some(77));
    }

    #[tokio::test]
    async fn metrics_uses_prometheus_text_format() {
        let response = build_router(test_state())
            .oneshot(get_request("/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn stats_reports_active_sinks() {
        let state = test_state();
        let _attachment = state.relay.attach();
        let response = build_router(Arc::clone(&state))
            .oneshot(get_request("/debug/stats"))
            .await
            .unwrap();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["active_sinks"], 1);
        assert_eq!(value["updates_applied"], 0);
    }

    #[tokio::test]
    async fn sse_streams_init_then_updates() {
        let state = test_state();
        let response = build_router(Arc::clone(&state))
            .oneshot(get_request("/sse"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body();
        let init = next_chunk(&mut body).await;
        assert!(init.starts_with("event: init"));
        let snapshot: Snapshot = serde_json::from_str(data_line(&init)).unwrap();
        assert_eq!(snapshot, state.relay.snapshot());

        state.relay.ingest("quarterA.col2.num5", b"77").unwrap();
        let update = next_chunk(&mut body).await;
        assert!(update.starts_with("event: update"));
        let value: serde_json::Value = serde_json::from_str(data_line(&update)).unwrap();
        assert_eq!(value, json!({ "path": "quarterA.col2.num5", "value": 77 }));
    }

    #[tokio::test]
    async fn shutdown_ends_the_event_stream() {
        let state = test_state();
        let response = build_router(Arc::clone(&state))
            .oneshot(get_request("/sse"))
            .await
            .unwrap();
        let mut body = response.into_body();
        next_chunk(&mut body).await;

        state.shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .unwrap();
        assert!(end.is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.relay.hub().active_sinks(), 0);
    }
}
