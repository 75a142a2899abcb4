//! Admin API: Axum server for inspecting and triggering settlement runs.
//!
//! CORS enabled for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{AdminState, AppState};

/// Bind the admin port and serve in a background task.
pub async fn spawn_admin(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin port {port}"))?;
    info!(port, "Admin server listening on http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Admin server stopped");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/runs", get(routes::list_runs).post(routes::trigger_run))
        .route("/api/episodes/:id", get(routes::get_episode))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::engine::BatchOrchestrator;
    use crate::storage::open_in_memory;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state(enabled: bool) -> AppState {
        let pool = open_in_memory().await.unwrap();
        let config = SettlementConfig {
            enabled,
            ..Default::default()
        };
        Arc::new(AdminState {
            orchestrator: Arc::new(BatchOrchestrator::new(pool.clone(), config)),
            pool,
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state(true).await);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_runs_empty() {
        let app = build_router(test_state(true).await);
        let resp = app
            .oneshot(Request::builder().uri("/api/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let json: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert!(json.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_then_list() {
        let state = test_state(false).await;

        let resp = build_router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/runs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "skipped");
        assert!(json["run_id"].as_i64().is_some());

        let resp = build_router(state)
            .oneshot(Request::builder().uri("/api/runs?limit=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let json: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.len(), 1);
        assert_eq!(json[0]["status"], "skipped");
    }

    #[tokio::test]
    async fn test_missing_episode_is_404() {
        let app = build_router(test_state(true).await);
        let resp = app
            .oneshot(Request::builder().uri("/api/episodes/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "episode 42 not found");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = build_router(test_state(true).await);
        let resp = app
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
