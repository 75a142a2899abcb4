//! Admin API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<AdminState>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tracing::{error, info};

use crate::engine::{BatchOrchestrator, RunSummary};
use crate::storage::collaborators::load_event;
use crate::storage::episodes::{load_episode, payouts_for_episode};
use crate::types::{Episode, EventWindow, Payout};

/// Upper bound on `/api/runs?limit=`.
const MAX_RUNS: i64 = 200;
const DEFAULT_RUNS: i64 = 20;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AdminState {
    pub pool: SqlitePool,
    pub orchestrator: Arc<BatchOrchestrator>,
}

pub type AppState = Arc<AdminState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EpisodeDetail {
    pub episode: Episode,
    pub event: Option<EventWindow>,
    pub payouts: Vec<Payout>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn internal(e: anyhow::Error) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{e:#}"),
        }),
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/runs: most recent run logs, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Vec<RunSummary>> {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS).clamp(1, MAX_RUNS);
    state
        .orchestrator
        .logger()
        .recent(limit)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Failed to list runs");
            internal(e)
        })
}

/// POST /api/runs: run one settlement batch now.
pub async fn trigger_run(State(state): State<AppState>) -> ApiResult<RunSummary> {
    info!("Settlement batch triggered via admin API");
    state
        .orchestrator
        .run_batch(Utc::now())
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Triggered batch failed");
            internal(e)
        })
}

/// GET /api/episodes/:id: one episode with its event window and payouts.
pub async fn get_episode(
    State(state): State<AppState>,
    Path(episode_id): Path<i64>,
) -> ApiResult<EpisodeDetail> {
    let episode = load_episode(&state.pool, episode_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("episode {episode_id} not found"),
                }),
            )
        })?;
    let event = load_event(&state.pool, episode.event_id).await.map_err(internal)?;
    let payouts = payouts_for_episode(&state.pool, episode_id)
        .await
        .map_err(internal)?;

    Ok(Json(EpisodeDetail {
        episode,
        event,
        payouts,
    }))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
