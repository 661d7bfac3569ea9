use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tracing::{error, info};

use crate::{
    api, cors,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, RelayError, REQUEST_ID_HEADER,
    },
    metrics::{self, RelayMetrics},
    ws::{self, RelayState},
};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

pub fn build_router(
    state: RelayState,
    metrics: Arc<RelayMetrics>,
    cors_origins: Option<&str>,
) -> Router {
    let admin =
        api::router(Arc::clone(&state.registry), metrics).layer(cors::cors_layer(cors_origins));
    apply_middleware(admin.merge(ws::router(state)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);

    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            let error = RelayError::from_code(ErrorCode::InternalError);
            match request_id {
                Some(request_id) => error.with_request_id(request_id),
                None => error,
            }
            .into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    // Upgrades are counted as connections, not requests.
    if status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, MAX_REQUEST_BODY_BYTES};
    use crate::{
        config::{LivenessSettings, RoomSettings},
        history::HistoryStore,
        metrics::RelayMetrics,
        sync::{Broadcaster, HistoryWriter, RoomRegistry},
        ws::RelayState,
    };

    fn test_router() -> Router {
        let store = HistoryStore::memory(Duration::from_secs(60));
        let (writer, _worker) = HistoryWriter::spawn(store.clone(), 64);
        let state = RelayState {
            registry: Arc::new(RoomRegistry::new(store, RoomSettings::default())),
            broadcaster: Broadcaster::new(writer),
            liveness: LivenessSettings::default(),
        };
        build_router(state, Arc::new(RelayMetrics::default()), None)
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/_relay/healthz")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|value| value.to_str().ok()),
            Some("req-42")
        );
    }

    #[tokio::test]
    async fn plain_get_on_document_path_is_not_an_upgrade() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/team/notes")
                    .body(Body::empty())
                    .expect("document request should build"),
            )
            .await
            .expect("document request should return a response");

        assert!(response.status().is_client_error());
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .header("x-request-id", "req-panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|value| value.to_str().ok()),
            Some("req-panic")
        );
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("panic response body should be readable");
        let parsed: serde_json::Value =
            serde_json::from_slice(&body).expect("panic response should be json");
        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
