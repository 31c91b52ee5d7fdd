//! HTTP server that captures inbound webhook deliveries.
//!
//! Routes:
//!   GET  /api/health          → health check
//!   ANY  /webhooks/{*path}    → store the delivery, reply with its id

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use hookscribe_common::event::NewEvent;
use hookscribe_common::protocol::{CaptureResponse, ErrorResponse, HealthResponse};
use hookscribe_common::store::EventStore;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    store: EventStore,
    start_time: Instant,
    max_body_bytes: usize,
}

impl AppState {
    pub fn new(store: EventStore, max_body_bytes: usize) -> Self {
        AppState {
            store,
            start_time: Instant::now(),
            max_body_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let limit = state.max_body_bytes;
    Router::new()
        .route("/api/health", get(health))
        .route("/webhooks/{*path}", any(capture))
        .layer(RequestBodyLimitLayer::new(limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(
    state: AppState,
    listen_addr: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Capture HTTP server listening on {listen_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
        }
    })
    .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.store.clone();
    let events = tokio::task::spawn_blocking(move || store.count())
        .await
        .ok()
        .and_then(|r| r.ok());

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        events,
        sessions: None,
    })
}

async fn capture(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let path = parts
        .uri
        .path()
        .strip_prefix("/webhooks")
        .unwrap_or(parts.uri.path())
        .to_string();

    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Rejected webhook body on {path}: {e}");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "webhook body too large");
        }
    };

    let mut event = NewEvent::new(parts.method.as_str(), &path, String::from_utf8_lossy(&bytes));
    event.source_ip = source_ip(&parts.headers, peer);
    event.content_type = header_str(&parts.headers, header::CONTENT_TYPE.as_str());
    event.content_length = header_str(&parts.headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse().ok())
        .or(Some(bytes.len() as u64));
    event.query_params = parse_query(&parts.uri);
    for (name, value) in &parts.headers {
        event.add_header(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
    }

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.insert(event)).await {
        Ok(Ok(stored)) => {
            info!("Captured {} {} as {}", stored.method, stored.path, stored.id);
            (StatusCode::OK, Json(CaptureResponse { id: stored.id })).into_response()
        }
        Ok(Err(e)) => {
            error!("Cannot store webhook for {path}: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "event store unavailable")
        }
        Err(e) => {
            error!("Store task failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "event store unavailable")
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// First `X-Forwarded-For` hop when present, otherwise the peer address.
fn source_ip(headers: &HeaderMap, peer: Option<String>) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .or(peer)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Decode the query string; repeated keys keep the last value.
fn parse_query(uri: &Uri) -> BTreeMap<String, String> {
    match Query::<Vec<(String, String)>>::try_from_uri(uri) {
        Ok(Query(pairs)) => pairs.into_iter().collect(),
        Err(e) => {
            warn!("Ignoring undecodable query string: {e}");
            BTreeMap::new()
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    fn temp_state(max_body_bytes: usize) -> AppState {
        let dir = std::env::temp_dir().join(format!("hookscribe_capture_{}", uuid::Uuid::new_v4()));
        let store = EventStore::open(&dir.join("webhooks.db")).unwrap();
        AppState::new(store, max_body_bytes)
    }

    #[tokio::test]
    async fn test_capture_stores_delivery() {
        let state = temp_state(1024);
        let store = state.store.clone();

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe/events?mode=test&attempt=2")
            .header("Content-Type", "application/json")
            .header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
            .header("Stripe-Signature", "t=1,v1=abc")
            .body(Body::from(r#"{"type":"charge.succeeded"}"#))
            .unwrap();

        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let reply: CaptureResponse = serde_json::from_slice(&bytes).unwrap();

        let stored = store.get(&reply.id).unwrap().unwrap();
        assert_eq!(stored.method, "POST");
        assert_eq!(stored.path, "/stripe/events");
        assert_eq!(stored.source_ip, "203.0.113.9");
        assert_eq!(stored.status_code, 200);
        assert_eq!(stored.content_type.as_deref(), Some("application/json"));
        assert_eq!(stored.query_params["mode"], "test");
        assert_eq!(stored.query_params["attempt"], "2");
        assert_eq!(stored.headers["stripe-signature"], "t=1,v1=abc");
        assert_eq!(stored.body, r#"{"type":"charge.succeeded"}"#);
    }

    #[tokio::test]
    async fn test_capture_accepts_any_method() {
        let state = temp_state(1024);
        let store = state.store.clone();

        let request = Request::builder()
            .method("PUT")
            .uri("/webhooks/github")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let page = store.range_before(None, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].method, "PUT");
        assert_eq!(page[0].path, "/github");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let state = temp_state(8);
        let store = state.store.clone();

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/big")
            .body(Body::from("0123456789abcdef"))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_reports_event_count() {
        let state = temp_state(1024);
        state
            .store
            .insert(NewEvent::new("POST", "/x", "{}"))
            .unwrap();

        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.events, Some(1));
    }
}
