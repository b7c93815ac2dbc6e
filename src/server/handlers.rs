//! HTTP and WebSocket handlers

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::relay::CloseReason;
use crate::server::AppState;
use crate::session::SessionConnector;

/// Liveness report
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// WebSocket upgrade, or the static index for plain requests
pub async fn root<C: SessionConnector>(
    State(state): State<Arc<AppState<C>>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        return upgrade(state, ws);
    }

    let Some(dir) = state.config.server.static_dir.as_ref() else {
        return (StatusCode::OK, "voice relay: connect with a WebSocket client").into_response();
    };
    match tokio::fs::read_to_string(dir.join("index.html")).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            tracing::warn!("Failed to read index page: {}", e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

pub async fn websocket<C: SessionConnector>(
    State(state): State<Arc<AppState<C>>>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ws)
}

fn upgrade<C: SessionConnector>(state: Arc<AppState<C>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket<C: SessionConnector>(state: Arc<AppState<C>>, socket: WebSocket) {
    let id = Uuid::new_v4();
    let (sink, stream) = socket.split();

    let summary = state
        .bridge
        .run(id, inbound_stream(stream), outbound_sink(sink))
        .await;

    let pipeline = &summary.pipeline;
    let message = format!(
        "Connection closed ({:?}): {} bytes in, {} frames decoded, {} skipped, {} chunks up, {} dropped, {} chunks down",
        summary.reason,
        pipeline.bytes_in,
        pipeline.frames_decoded,
        pipeline.frames_skipped,
        pipeline.uplink.chunks_queued,
        pipeline.uplink.chunks_dropped,
        summary.downlink.chunks_forwarded,
    );
    match summary.reason {
        CloseReason::ClientClosed | CloseReason::SessionEnded(_) => {
            tracing::info!(connection = %id, "{}", message)
        }
        _ => tracing::warn!(connection = %id, "{}", message),
    }
}

/// Binary messages only; text and control frames are ignored
pub fn inbound_stream<S>(
    stream: S,
) -> impl Stream<Item = Result<Bytes, TransportError>> + Unpin + Send
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + 'static,
{
    Box::pin(stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
            Ok(Message::Text(_)) => {
                tracing::debug!("Ignoring text message");
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
        })
    }))
}

/// Every outbound chunk becomes one binary message
pub fn outbound_sink<K>(sink: K) -> impl Sink<Bytes, Error = TransportError> + Unpin + Send + 'static
where
    K: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
{
    sink.with(|data: Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(data.to_vec()))))
        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
}
