// Health and stats endpoints for the worker

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use lambda_common::queue::{JobQueue, QueueDepth};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::dispatcher::{DispatcherStats, StatsSnapshot};

#[derive(Clone)]
pub struct HealthState {
    pub stats: Arc<DispatcherStats>,
    pub queue: Arc<dyn JobQueue>,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub dispatcher: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueDepth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_error: Option<String>,
}

pub fn routes(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<HealthState>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Health server listening on {}", addr);
    axum::serve(listener, routes(state)).await?;
    Ok(())
}

pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn stats(State(state): State<Arc<HealthState>>) -> Json<StatsResponse> {
    let (queue, queue_error) = match state.queue.depth().await {
        Ok(depth) => (Some(depth), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Json(StatsResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        dispatcher: state.stats.snapshot(),
        queue,
        queue_error,
    })
}
