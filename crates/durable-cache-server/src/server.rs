//! HTTP server for cache endpoints
//!
//! Provides /health and /entries/{key} endpoints.

use crate::types::HealthResponse;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use chrono::{DateTime, Utc};
use durable_disk_cache::{CancelSignal, DiskCache, DiskCacheError};
use serde::Serialize;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Largest request body accepted by `PUT /entries/{key}`
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Bodies are staged in chunks of this size so a superseded write stops early
const WRITE_CHUNK_BYTES: usize = 256 * 1024;

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: DiskCache,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: DiskCache) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/entries/{key}",
            get(get_entry).put(put_entry).delete(delete_entry),
        )
        .route("/entries", delete(clear_entries))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server, returning once `shutdown` resolves and in-flight
/// requests have drained
pub async fn start_server<S>(state: SharedState, port: u16, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache_stats = state.cache.stats().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: cache_stats,
    })
}

/// Get the stored bytes for a key
async fn get_entry(State(state): State<SharedState>, Path(key): Path<String>) -> Response {
    match state.cache.read(&key).await {
        Ok(Some(data)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE.as_str(), "application/octet-stream"),
                ("x-cache", "HIT"),
            ],
            data,
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            [("x-cache", "MISS")],
            Json(ErrorResponse {
                error: "Entry not found".to_string(),
            }),
        )
            .into_response(),
        Err(e) => cache_error(&key, e),
    }
}

/// Store the request body under a key, replacing any previous value
async fn put_entry(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let size = body.len() as i64;
    if size > state.cache.max_size() {
        return insufficient_storage(size);
    }

    let result = state
        .cache
        .put(&key, move |path, cancel| async move {
            tokio::task::spawn_blocking(move || write_body(&path, &body, &cancel))
                .await
                .map_err(std::io::Error::other)?
        })
        .await;

    match result {
        Ok(Some(_)) => {
            info!(key = %key, size, "Entry stored");
            StatusCode::CREATED.into_response()
        }
        // Evicted as soon as it was committed
        Ok(None) => insufficient_storage(size),
        Err(e) => cache_error(&key, e),
    }
}

/// Write `body` to the staging file in chunks, giving up once the creation
/// has been cancelled by a newer write or a delete
fn write_body(
    path: &std::path::Path,
    body: &[u8],
    cancel: &CancelSignal,
) -> std::io::Result<bool> {
    let mut file = std::fs::File::create(path)?;
    for chunk in body.chunks(WRITE_CHUNK_BYTES) {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        file.write_all(chunk)?;
    }
    file.sync_all()?;
    Ok(true)
}

/// Remove a key
async fn delete_entry(State(state): State<SharedState>, Path(key): Path<String>) -> Response {
    match state.cache.remove(&key).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => cache_error(&key, e),
    }
}

/// Remove every entry
async fn clear_entries(State(state): State<SharedState>) -> Response {
    match state.cache.clear().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(error = %e, "Failed to clear cache");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn insufficient_storage(size: i64) -> Response {
    error_response(
        StatusCode::INSUFFICIENT_STORAGE,
        format!("Entry of {} bytes does not fit in the cache", size),
    )
}

fn cache_error(key: &str, err: DiskCacheError) -> Response {
    let status = match &err {
        DiskCacheError::KeyInvalid(_) => StatusCode::BAD_REQUEST,
        DiskCacheError::Cancelled => StatusCode::CONFLICT,
        DiskCacheError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(key = %key, error = %err, "Cache operation failed");
    } else {
        warn!(key = %key, error = %err, "Cache request rejected");
    }
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}
