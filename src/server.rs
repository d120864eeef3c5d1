//! HTTP API server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/api/references?keywords=a,b` | List references, optionally by keyword intersection |
//! | `GET`    | `/api/references/{id}?contents=true` | One reference with its keywords |
//! | `GET`    | `/api/references/{id}/keywords` | Keywords of a reference |
//! | `GET`    | `/api/references/{id}/contents` | Raw contents of a reference |
//! | `POST`   | `/api/references/add` | Add a reference: `{"type": "url", "contents": "<url>"}` |
//! | `DELETE` | `/api/references/{id}` | Delete a reference |
//! | `POST`   | `/api/references/{id}/reindex` | Re-fetch and re-index |
//! | `GET`    | `/api/keywords/counts?tags=a,b` | Keyword counts, optionally over an intersection |
//! | `GET`    | `/api/keywords` | All keywords |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "reference not found: ..." } }
//! ```
//!
//! Error codes: `bad_request` / `invalid_type` (400), `not_found` (404),
//! `fetch_failed` (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser front end
//! on another origin can call the API.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use refindex_core::models::Reference;

use crate::config::Config;
use crate::error::Error;
use crate::references::ReferenceStore;

#[derive(Clone)]
struct AppState {
    references: Arc<ReferenceStore>,
}

/// Build the API router over a reference service.
pub fn router(references: Arc<ReferenceStore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/references", get(handle_list))
        .route("/api/references/add", post(handle_add))
        .route(
            "/api/references/{id}",
            get(handle_get).delete(handle_delete),
        )
        .route("/api/references/{id}/keywords", get(handle_reference_keywords))
        .route("/api/references/{id}/contents", get(handle_contents))
        .route("/api/references/{id}/reindex", post(handle_reindex))
        .route("/api/keywords", get(handle_keywords))
        .route("/api/keywords/counts", get(handle_counts))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { references })
}

/// Open the database and serve the API on `[server].bind` until Ctrl-C.
///
/// On shutdown, in-flight indexing jobs are allowed to finish.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let references = Arc::new(ReferenceStore::open(config).await?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "API server listening");

    axum::serve(listener, router(references.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    references.wait_idle().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Fetch { .. } => StatusCode::BAD_GATEWAY,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidKind(_) => StatusCode::BAD_REQUEST,
            Error::Storage(e) => {
                tracing::error!(error = %format!("{:#}", e), "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn not_found(id: &str) -> AppError {
    Error::NotFound { id: id.to_string() }.into()
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Split a comma-separated query value, dropping empty items.
fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ References ============

#[derive(Deserialize)]
struct ListQuery {
    keywords: Option<String>,
    #[serde(default)]
    contents: bool,
}

async fn handle_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Reference>>, AppError> {
    let keywords = split_csv(query.keywords.as_deref());
    let refs = state.references.list(query.contents, &keywords).await?;
    Ok(Json(refs))
}

#[derive(Deserialize)]
struct GetQuery {
    #[serde(default)]
    contents: bool,
}

async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetQuery>,
) -> Result<Json<Reference>, AppError> {
    state
        .references
        .get(&id, query.contents, true)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

async fn handle_reference_keywords(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.references.keywords_for(&id).await?))
}

async fn handle_contents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<String>, AppError> {
    state
        .references
        .get_contents(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

/// Body of `POST /api/references/add`. `contents` carries the source (the URL).
#[derive(Deserialize)]
struct AddRequest {
    #[serde(rename = "type")]
    kind: String,
    contents: String,
}

async fn handle_add(
    State(state): State<AppState>,
    Json(req): Json<AddRequest>,
) -> Result<Json<Reference>, AppError> {
    if req.contents.trim().is_empty() {
        return Err(bad_request("contents must not be empty"));
    }
    Ok(Json(state.references.add(&req.kind, &req.contents).await?))
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    state.references.delete(&id).await?;
    Ok(Json(StatusResponse { status: "success" }))
}

async fn handle_reindex(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Reference>, AppError> {
    Ok(Json(state.references.reindex(&id).await?))
}

// ============ Keywords ============

async fn handle_keywords(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.references.keywords().list_all().await?))
}

#[derive(Deserialize)]
struct CountsQuery {
    tags: Option<String>,
}

async fn handle_counts(
    State(state): State<AppState>,
    Query(query): Query<CountsQuery>,
) -> Result<Json<IndexMap<String, i64>>, AppError> {
    let tags = split_csv(query.tags.as_deref());
    Ok(Json(state.references.keyword_counts(&tags).await?))
}
