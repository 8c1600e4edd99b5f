//! HTTP and WebSocket surface.
//!
//! `/ws` carries the client protocol: admission on connect, a
//! `connection_ack`, then JSON frames both ways. Outbound frames above the
//! compression threshold go out as deflated binary frames on sessions that
//! negotiated compression.

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::compression::{self, Compressor};
use crate::error::FabricError;
use crate::models::{ClientFrame, RequestOrigin, ServerFrame};
use crate::orchestrator::Orchestrator;
use crate::session::{AcceptParams, Outbound};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub prometheus: Option<PrometheusHandle>,
    compressor: Compressor,
    compression_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, prometheus: Option<PrometheusHandle>) -> Self {
        let config = orchestrator.config();
        let compressor = Compressor::new(config.compression_level, config.compression_threshold_bytes);
        let compression_permits = Arc::new(Semaphore::new(config.compression_concurrency.max(1)));
        Self {
            orchestrator,
            prometheus,
            compressor,
            compression_permits,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/snapshot", get(get_snapshot))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve until `cancel` fires.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Fabric listening");
    let app = build_router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;
    let load = orchestrator.admission().load_monitor();
    Json(json!({
        "status": "ok",
        "sessions": orchestrator.registry().active(),
        "load": load.load(),
        "level": load.level().as_str(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn get_snapshot(State(state): State<AppState>) -> Json<crate::orchestrator::MetricsSnapshot> {
    let snapshot = match state.orchestrator.latest_snapshot() {
        Some(snapshot) => snapshot,
        None => state.orchestrator.collect_metrics(),
    };
    Json(snapshot)
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    #[serde(default)]
    compression: Option<String>,
}

fn rejection_response(err: FabricError) -> Response {
    let status = StatusCode::from_u16(err.code()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(err.into_rejection())).into_response()
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let mut origin = RequestOrigin::anonymous(remote.ip());
    if let Some(ua) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        origin = origin.with_user_agent(ua);
    }
    if let Err(err) = state.orchestrator.admit_connection(&origin) {
        debug!(%remote, reason = err.reason(), "Connection refused at admission");
        return rejection_response(err);
    }

    let compression = params.compression.as_deref() == Some("deflate")
        && state.compressor.level() > 0;
    ws.on_upgrade(move |socket| handle_socket(socket, state, origin, remote, compression))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    mut origin: RequestOrigin,
    remote: SocketAddr,
    compression: bool,
) {
    let orchestrator = state.orchestrator.clone();
    let registry = orchestrator.registry().clone();
    let (mut sink, mut stream) = socket.split();

    let shard = orchestrator.session_shard(remote.ip());
    let mut params = AcceptParams::new(remote, shard);
    params.user_agent = origin.user_agent.clone();
    params.class = origin.class;
    params.compression = compression;
    let handle = match registry.accept(params) {
        Ok(handle) => handle,
        Err(err) => {
            let frame = ServerFrame::Rejected {
                request_id: None,
                rejection: err.into_rejection(),
            };
            let _ = sink.send(Message::Text(frame.encode())).await;
            let _ = sink.close().await;
            return;
        }
    };
    let id = handle.id;
    origin.session = Some(id);

    let _ = registry.send(
        &id,
        ServerFrame::ConnectionAck {
            connection_id: id,
            shard_id: shard,
            timestamp: chrono::Utc::now().timestamp_millis(),
            compression,
        },
    );

    let writer = tokio::spawn(write_loop(
        sink,
        handle.egress,
        handle.closed.clone(),
        compression.then(|| (state.compressor, state.compression_permits.clone())),
    ));

    let max_payload = orchestrator.config().max_payload_bytes;
    let mut reason = "client_closed";
    loop {
        let message = tokio::select! {
            _ = handle.closed.cancelled() => {
                reason = "server_closed";
                break;
            }
            message = stream.next() => message,
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match decode_binary(&data, max_payload) {
                Ok(text) => text,
                Err(err) => {
                    let _ = registry.send(&id, reject(None, err));
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {
                registry.touch(&id);
                continue;
            }
            Some(Err(e)) => {
                debug!(session = %id, error = %e, "Socket read failed");
                reason = "transport_error";
                break;
            }
        };
        registry.touch(&id);

        let frame = match ClientFrame::decode(&text, max_payload) {
            Ok(ClientFrame::Ping { timestamp }) => ServerFrame::Pong {
                timestamp: timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            },
            Ok(ClientFrame::Pong) => continue,
            Ok(ClientFrame::Request(request)) => {
                let request_id = request.id.clone();
                orchestrator
                    .submit_request(request, origin.clone())
                    .await
                    .into_frame(request_id)
            }
            Err(err) => reject(None, err),
        };
        // A full egress drops the frame; the registry counts it.
        let _ = registry.send(&id, frame);
    }

    registry.close(&id, reason);
    if let Err(e) = writer.await {
        warn!(session = %id, error = %e, "Writer task failed");
    }
}

fn reject(request_id: Option<String>, err: FabricError) -> ServerFrame {
    ServerFrame::Rejected {
        request_id,
        rejection: err.into_rejection(),
    }
}

/// Binary frames from clients are deflated JSON.
fn decode_binary(data: &[u8], max_payload: usize) -> Result<String, FabricError> {
    let inflated = compression::decompress(data, max_payload).map_err(|_| FabricError::PayloadTooLarge {
        size: data.len(),
        limit: max_payload,
    })?;
    String::from_utf8(inflated).map_err(|_| FabricError::BadRequest("binary frame is not UTF-8".into()))
}

async fn write_loop<S>(
    mut sink: S,
    mut egress: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    compression: Option<(Compressor, Arc<Semaphore>)>,
) where
    S: futures_util::Sink<Message> + Unpin,
{
    loop {
        let outbound = tokio::select! {
            biased;
            outbound = egress.recv() => outbound,
            _ = closed.cancelled() => egress.try_recv().ok(),
        };
        let Some(outbound) = outbound else { break };
        match outbound {
            Outbound::Frame(frame) => {
                let message = encode_frame(&frame, compression.as_ref()).await;
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            Outbound::Close(reason) => {
                let notice = ServerFrame::Close {
                    reason: reason.clone(),
                };
                let _ = sink.send(Message::Text(notice.encode())).await;
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: axum::extract::ws::close_code::NORMAL,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn encode_frame(frame: &ServerFrame, compression: Option<&(Compressor, Arc<Semaphore>)>) -> Message {
    let text = frame.encode();
    let Some((compressor, permits)) = compression else {
        return Message::Text(text);
    };
    if !compressor.should_compress(text.len()) {
        return Message::Text(text);
    }
    let Ok(_permit) = permits.acquire().await else {
        return Message::Text(text);
    };
    match compressor.maybe_compress(text.as_bytes()) {
        Some(deflated) => {
            metrics::increment_counter!("fabric_frames_compressed_total");
            Message::Binary(deflated)
        }
        None => Message::Text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use crate::orchestrator::StaticProbe;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState {
        let orchestrator = Orchestrator::new(FabricConfig::default())
            .with_probe(Arc::new(StaticProbe::default()));
        AppState::new(Arc::new(orchestrator), None)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(build_router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["level"], "NORMAL");
    }

    #[tokio::test]
    async fn test_snapshot_collects_when_empty() {
        let (status, body) = get_json(build_router(state()), "/api/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"]["active"], 0);
        assert!(body["store"].is_object());
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (status, _) = get_json(build_router(state()), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_binary_frames_are_inflated() {
        let compressor = Compressor::new(6, 0);
        let deflated = compressor.compress(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(decode_binary(&deflated, 1024).unwrap(), r#"{"type":"ping"}"#);
        assert!(decode_binary(b"not deflate at all", 1024).is_err());
    }
}
