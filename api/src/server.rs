//! HTTP API for listing captured webhooks and generating handler code.
//!
//! Routes:
//!   GET  /api/health               → health check
//!   GET  /api/webhooks             → cursor-paginated listing (`cursor`, `limit`)
//!   GET  /api/webhooks/{id}        → one captured event
//!   POST /api/generate             → buffered generation, `{ code }`
//!   POST /api/generate/stream      → generated code as a chunked text body

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use hookscribe_common::event::{CapturedEvent, EventId, InvalidEventId};
use hookscribe_common::protocol::{
    GenerateRequest, GenerateResponse, HealthResponse, ListQuery, ListResponse,
};
use hookscribe_common::store::{EventStore, StoreError};

use crate::aggregate::EventSelection;
use crate::error::{ApiError, ValidationError};
use crate::generation::GenerationClient;
use crate::pagination::{paginate, parse_cursor, PageSize};
use crate::prompt::{GenerationRequest, PromptTemplate};
use crate::relay::Relay;
use crate::session::{GenerationSession, SessionState, SessionStats};

/// Response header carrying the id of a streamed generation session.
pub const SESSION_HEADER: &str = "x-generation-session";

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    store: EventStore,
    generator: Arc<dyn GenerationClient>,
    relay: Relay,
    template: PromptTemplate,
    sessions: Arc<SessionStats>,
    start_time: Instant,
}

impl AppState {
    pub fn new(
        store: EventStore,
        generator: Arc<dyn GenerationClient>,
        relay: Relay,
        template: PromptTemplate,
    ) -> Self {
        AppState {
            store,
            generator,
            relay,
            template,
            sessions: Arc::new(SessionStats::default()),
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/webhooks", get(list_webhooks))
        .route("/api/webhooks/{id}", get(get_webhook))
        .route("/api/generate", post(generate))
        .route("/api/generate/stream", post(generate_stream))
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
    info!("API server listening on {listen_addr}");

    axum::serve(listener, app)
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

/// Run a store operation on the blocking pool.
async fn blocking<T, F>(store: &EventStore, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&EventStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    Ok(tokio::task::spawn_blocking(move || op(&store)).await??)
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let events = blocking(&state.store, |store| store.count()).await.ok();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        events,
        sessions: Some(state.sessions.snapshot()),
    })
}

async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let size = PageSize::parse(query.limit.as_deref())?;
    let cursor = parse_cursor(query.cursor.as_deref())?;

    let page = blocking(&state.store, move |store| paginate(store, cursor.as_ref(), size)).await?;

    Ok(Json(ListResponse {
        items: page.items,
        next_cursor: page.next_cursor,
    }))
}

async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CapturedEvent>, ApiError> {
    let id: EventId = id
        .parse()
        .map_err(|e: InvalidEventId| ValidationError::new(e.to_string()))?;

    blocking(&state.store, move |store| store.get(&id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("event {id}")))
}

/// Validate the selection and build the prompt from the stored bodies.
async fn prepare(state: &AppState, req: &GenerateRequest) -> Result<GenerationRequest, ApiError> {
    let selection = EventSelection::parse(&req.event_ids)?;
    let template = state.template.clone();

    let request = blocking(&state.store, move |store| {
        GenerationRequest::build(store, &selection, &template)
    })
    .await?;

    info!(
        "Generating {} handler from {} of {} selected events ({} prompt bytes)",
        state.template.language(),
        request.aggregate.resolved,
        request.aggregate.requested,
        request.prompt.len()
    );
    Ok(request)
}

async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    let request = prepare(&state, &req).await?;
    let code = state.generator.generate_buffered(&request.prompt).await?;
    Ok((StatusCode::CREATED, Json(GenerateResponse { code })))
}

async fn generate_stream(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let request = prepare(&state, &req).await?;

    let session = Arc::new(GenerationSession::new());
    let chunks = state.generator.generate_streaming(&request.prompt).await?;
    let (body, producer) = state.relay.start(session.clone(), chunks);

    state.sessions.started();
    let stats = state.sessions.clone();
    let session_id = session.id();
    tokio::spawn(async move {
        match producer.await {
            Ok(end) => stats.record(end),
            Err(e) => {
                warn!("Producer for session {session_id} did not finish: {e}");
                stats.record(SessionState::Failed);
            }
        }
    });

    info!("Streaming generation session {}", session.id());
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (HeaderName::from_static(SESSION_HEADER), session.id().to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

// ─── tests ───────────────────────────────────────────────────────────────
