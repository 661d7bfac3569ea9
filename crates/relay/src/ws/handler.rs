use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{liveness::run_liveness_monitor, session::ClientSession};
use crate::{
    config::LivenessSettings,
    metrics,
    sync::{broadcast::run_delivery, Broadcaster, RoomRegistry},
};

/// Everything a connection needs, cloned into each upgrade.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<RoomRegistry>,
    pub broadcaster: Broadcaster,
    pub liveness: LivenessSettings,
}

/// Document routes: `/` is the default document, any other path names one.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ws_default_document))
        .route("/{*doc_path}", get(ws_document))
        .with_state(state)
}

async fn ws_default_document(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    let doc_id = state.registry.settings().default_document.clone();
    upgrade(ws, state, doc_id)
}

async fn ws_document(
    ws: WebSocketUpgrade,
    Path(doc_path): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    let doc_id = document_id(&doc_path, &state.registry.settings().default_document);
    upgrade(ws, state, doc_id)
}

/// The addressed path is the document id; an empty path maps to `fallback`.
pub fn document_id(doc_path: &str, fallback: &str) -> String {
    let doc_path = doc_path.strip_prefix('/').unwrap_or(doc_path);
    if doc_path.is_empty() {
        fallback.to_string()
    } else {
        doc_path.to_string()
    }
}

fn upgrade(ws: WebSocketUpgrade, state: RelayState, doc_id: String) -> Response {
    let failed_doc_id = doc_id.clone();
    ws.on_failed_upgrade(move |error| {
        warn!(doc_id = %failed_doc_id, error = %error, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| handle_socket(socket, state, doc_id))
}

async fn handle_socket(socket: WebSocket, state: RelayState, doc_id: String) {
    let (sink, mut stream) = socket.split();
    let (session, outbound) = ClientSession::new(
        doc_id.clone(),
        Box::pin(sink),
        state.registry.settings().outbound_queue,
    );
    let session_id = session.id();

    let (room, history) = state.registry.admit(&doc_id, Arc::clone(&session)).await;
    metrics::record_connection_opened();
    info!(
        doc_id = %doc_id,
        session_id = %session_id,
        replay = history.len(),
        "client joined room"
    );

    let replay = if state.registry.settings().replay_on_join { history } else { Vec::new() };
    let delivery =
        tokio::spawn(run_delivery(Arc::clone(&session), Arc::clone(&room), replay, outbound));
    let liveness = tokio::spawn(run_liveness_monitor(Arc::clone(&session), state.liveness));

    let mut fragments_received = 0u64;
    loop {
        tokio::select! {
            _ = session.closed() => break,
            next = stream.next() => {
                match next {
                    Some(Ok(Message::Binary(payload))) => {
                        fragments_received += 1;
                        state.broadcaster.ingest(&room, payload, session_id).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => session.touch(),
                    Some(Ok(Message::Text(_))) => {
                        debug!(session_id = %session_id, "ignoring text frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(error)) => {
                        debug!(session_id = %session_id, error = %error, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    session.close();
    room.remove(session_id).await;
    delivery.abort();
    liveness.abort();
    metrics::record_connection_closed();
    info!(
        doc_id = %doc_id,
        session_id = %session_id,
        fragments_received,
        connected_secs = (chrono::Utc::now() - session.joined_at()).num_seconds(),
        "client left room"
    );
}
