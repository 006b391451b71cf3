//! Axum read surface over the store and the position cache.
//!
//! Provides:
//!   GET /health                  → "ok"
//!   GET /worm/positions?id&limit → positions with id > `id` (store)
//!   GET /worm/positions/recent   → current cache window
//!   GET /worm/overview           → { recent, historical }
//!   GET /api/metrics             → pipeline counters

use crate::cache::PositionCache;
use crate::config::ServerConfig;
use crate::metrics::PipelineMetrics;
use crate::position::Position;
use crate::store::Store;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state for the routes.
#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<dyn Store>,
    pub cache: Arc<PositionCache>,
    pub metrics: Arc<PipelineMetrics>,
    pub recent_count: usize,
    pub sample_count: usize,
    pub max_page: usize,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<PositionCache>,
        metrics: Arc<PipelineMetrics>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            recent_count: config.recent_count,
            sample_count: config.sample_count,
            max_page: config.max_page.max(1),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PositionsQuery {
    pub id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub recent: Vec<Position>,
    pub historical: Vec<Position>,
}

/// Build the Axum router.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/worm/positions", get(worm_positions))
        .route("/worm/positions/recent", get(worm_recent))
        .route("/worm/overview", get(worm_overview))
        .route("/api/metrics", get(api_metrics))
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(state: ServerState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "read server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// --- Handlers ---

async fn health() -> &'static str {
    "ok"
}

async fn worm_positions(
    State(state): State<ServerState>,
    Query(query): Query<PositionsQuery>,
) -> Response {
    let after_id = match query.id.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => id,
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid id").into_response(),
        },
    };
    let limit = query.limit.unwrap_or(state.max_page).clamp(1, state.max_page);

    match state.store.fetch_positions(after_id, limit).await {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => {
            warn!(error = %e, after_id = after_id, "failed to fetch positions");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch positions").into_response()
        }
    }
}

async fn worm_recent(State(state): State<ServerState>) -> Response {
    Json(state.cache.get().as_ref().clone()).into_response()
}

async fn worm_overview(State(state): State<ServerState>) -> Response {
    let recent = state.cache.recent(state.recent_count);
    match state.store.fetch_sample(state.sample_count).await {
        Ok(historical) => Json(Overview { recent, historical }).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to sample positions");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to sample positions").into_response()
        }
    }
}

async fn api_metrics(State(state): State<ServerState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}
