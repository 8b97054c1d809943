use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use verdict_core::event::{CONNECTION_MESSAGE, Cursor, Event};
use verdict_core::service::{AccessError, CheckService, SubmitError, SubmitRequest};

/// Header carrying the caller identity set by the upstream gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

/// How often expired logs are purged while serving.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        let message = err.to_string();
        match err {
            SubmitError::Invalid(_) => Self::bad_request(message),
            SubmitError::Conflict(_) => Self {
                status: StatusCode::CONFLICT,
                message,
            },
            SubmitError::Store(e) => Self::internal(e),
        }
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        let message = err.to_string();
        let status = match err {
            AccessError::NotFound => StatusCode::NOT_FOUND,
            AccessError::Forbidden => StatusCode::FORBIDDEN,
            AccessError::NotCompleted => StatusCode::BAD_REQUEST,
            AccessError::Store(e) => return Self::internal(e),
        };
        Self { status, message }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBody {
    pub content: String,
    pub check_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub check_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityBody {
    pub is_public: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub service: CheckService,
    /// Cancelled on shutdown; ends every open stream.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agent/run", post(run_check))
        .route("/api/agent/stream/{id}", get(stream_check))
        .route("/api/agent/checks", get(list_checks))
        .route("/api/agent/checks/{id}/public", patch(set_visibility))
        .route("/api/agent/public/{id}", get(public_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(service: CheckService, bind: &str, port: u16) -> Result<()> {
    let shutdown = CancellationToken::new();
    let purger = tokio::spawn(purge_loop(service.clone(), shutdown.child_token()));

    let app = build_router(AppState {
        service,
        shutdown: shutdown.clone(),
    });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("verdict serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = purger.await;
    info!("verdict serve shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    shutdown.cancel();
}

async fn purge_loop(service: CheckService, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match service.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged expired event logs"),
            Err(e) => warn!(error = %e, "failed to purge expired event logs"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn caller(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Resume position: `Last-Event-ID` wins over `?cursor=`.
fn resume_cursor(headers: &HeaderMap, query: &StreamQuery) -> Cursor {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .or(query.cursor.as_deref())
        .map(Cursor::parse)
        .unwrap_or_default()
}

fn to_sse(event: &Event) -> SseEvent {
    let sse = SseEvent::default()
        .event(event.kind.as_str())
        .data(event.payload.to_string());
    if event.is_resumable() {
        sse.id(event.seq.to_string())
    } else {
        sse
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn run_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunBody>,
) -> Result<Json<RunResponse>, AppError> {
    let submitted = state
        .service
        .submit(SubmitRequest {
            check_id: body.check_id,
            content: body.content,
            owner_id: caller(&headers),
        })
        .await?;
    Ok(Json(RunResponse {
        check_id: submitted.check_id,
    }))
}

async fn stream_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let cursor = resume_cursor(&headers, &query);
    let events = state
        .service
        .open_stream(&id, cursor, state.shutdown.child_token())
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("check {id} not found")))?;
    info!(job_id = %id, ?cursor, "stream opened");

    let connection = SseEvent::default()
        .event("connection")
        .data(json!({ "message": CONNECTION_MESSAGE }).to_string());
    let body = stream::once(async move { connection })
        .chain(events.map(|event| to_sse(&event)))
        .map(Ok);

    Ok(Sse::new(body).keep_alive(KeepAlive::default()))
}

async fn list_checks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = caller(&headers);
    let checks = state
        .service
        .list(owner.as_deref())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(checks).into_response())
}

async fn set_visibility(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<VisibilityBody>,
) -> Result<Response, AppError> {
    let owner = caller(&headers);
    let job = state
        .service
        .set_visibility(&id, owner.as_deref(), body.is_public)
        .await?;
    Ok(Json(job).into_response())
}

async fn public_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let check = state.service.public_view(&id).await?;
    Ok(Json(check).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
