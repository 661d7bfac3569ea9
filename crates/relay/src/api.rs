//! Operational endpoints under `/_relay/`.
//!
//! Document ids may be any path, so the admin surface lives under a prefix
//! that the document routes never shadow.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::{
    error::{ErrorCode, RelayError},
    metrics::RelayMetrics,
    sync::{RoomRegistry, RoomStats},
};

pub const ADMIN_PREFIX: &str = "/_relay";

#[derive(Clone)]
struct AdminState {
    registry: Arc<RoomRegistry>,
    metrics: Arc<RelayMetrics>,
}

pub fn router(registry: Arc<RoomRegistry>, metrics: Arc<RelayMetrics>) -> Router {
    Router::new()
        .route(&format!("{ADMIN_PREFIX}/healthz"), get(healthz))
        .route(&format!("{ADMIN_PREFIX}/readyz"), get(readyz))
        .route(&format!("{ADMIN_PREFIX}/metrics"), get(render_metrics))
        .route(&format!("{ADMIN_PREFIX}/rooms"), get(list_rooms))
        .route(&format!("{ADMIN_PREFIX}/rooms/{{*doc_id}}"), get(get_room))
        .with_state(AdminState { registry, metrics })
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AdminState>) -> Result<(StatusCode, &'static str), RelayError> {
    state.registry.store().health_check().await.map_err(|error| {
        RelayError::from_code(ErrorCode::StoreUnavailable).with_details(json!({
            "store": state.registry.store().kind(),
            "reason": error.to_string(),
        }))
    })?;
    Ok((StatusCode::OK, "ready"))
}

async fn render_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let rooms = state.registry.room_stats().await;
    let sessions = rooms.iter().map(|room| room.sessions).sum();
    state.metrics.set_room_gauges(rooms.len(), sessions);
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.render_prometheus())
}

async fn list_rooms(State(state): State<AdminState>) -> Json<Vec<RoomStats>> {
    Json(state.registry.room_stats().await)
}

async fn get_room(
    State(state): State<AdminState>,
    Path(doc_id): Path<String>,
) -> Result<Json<RoomStats>, RelayError> {
    let room = state.registry.get(&doc_id).await.ok_or_else(|| {
        RelayError::new(ErrorCode::NotFound, "room is not loaded")
            .with_details(json!({ "doc_id": doc_id }))
    })?;
    Ok(Json(room.stats(tokio::time::Instant::now()).await))
}
