//! HTTP adapter over the query engine.
//!
//! A thin axum surface exposing search, stats, and health. The engine is
//! constructed once at startup and shared read-only across request
//! handlers; the server never constructs prose answers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Run one retrieval strategy with optional rerank |
//! | `GET`  | `/stats` | Corpus and community counters |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `dimension_mismatch` (400),
//! `internal` (500).

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::model::{SearchHit, Strategy};
use crate::query::{QueryEngine, SearchRequest};
use crate::store::StoreStats;

#[derive(Clone)]
struct AppState {
    engine: Arc<QueryEngine>,
}

/// Starts the HTTP server on `bind` and serves until terminated.
pub async fn run_server(engine: Arc<QueryEngine>, bind: &str) -> anyhow::Result<()> {
    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", post(handle_search))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(%bind, "query server listening");
    println!("query server listening on http://{}", bind);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ POST /search ============

#[derive(Deserialize)]
struct HttpSearchRequest {
    query: String,
    /// One of: vector, keyword, graph, hybrid, community, nl_to_graph.
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    rerank: bool,
    #[serde(default)]
    filters: Option<HttpSearchFilters>,
}

#[derive(Deserialize, Default)]
struct HttpSearchFilters {
    division: Option<String>,
    category: Option<String>,
}

fn default_strategy() -> String {
    "hybrid".to_string()
}

#[derive(Serialize)]
struct HttpSearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<HttpSearchRequest>,
) -> Result<Json<HttpSearchResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let Some(strategy) = Strategy::parse(&request.strategy) else {
        return Err(bad_request(format!(
            "Unknown strategy: {}. Use vector, keyword, graph, hybrid, community, or nl_to_graph.",
            request.strategy
        )));
    };

    let filters = request.filters.unwrap_or_default();
    let results = state
        .engine
        .search(&SearchRequest {
            text: request.query,
            strategy,
            top_k: request.top_k,
            rerank: request.rerank,
            division: filters.division,
            category: filters.category,
        })
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("dimension mismatch") {
                AppError {
                    status: StatusCode::BAD_REQUEST,
                    code: "dimension_mismatch".to_string(),
                    message,
                }
            } else {
                internal_error(message)
            }
        })?;

    Ok(Json(HttpSearchResponse { results }))
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    let stats = state
        .engine
        .stats()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(stats))
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
