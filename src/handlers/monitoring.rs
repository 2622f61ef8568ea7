//! Observability endpoints: health, status, metrics, manual task triggers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::work_item::WorkItemType;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: bool,
    pub workers_healthy: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Liveness plus a cheap database ping
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let database = crate::database::health_check(&state.db_pool).await;
    let workers_healthy = state.orchestrator.is_healthy().await;
    let healthy = database && workers_healthy;

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        database,
        workers_healthy,
        timestamp: chrono::Utc::now(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Readiness: the process can serve once the database answers
pub async fn readiness_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    if !crate::database::health_check(&state.db_pool).await {
        return Err(AppError::ServiceUnavailable {
            service: "database".to_string(),
        });
    }
    Ok(Json(serde_json::json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub workers: Vec<crate::services::WorkerStatusReport>,
    pub scheduler: Vec<crate::services::TaskReport>,
    pub queue: Vec<crate::repositories::QueueDepth>,
    pub downloads: Vec<crate::repositories::DownloadCount>,
    pub library: crate::repositories::LibraryStats,
    pub circuit_breakers: Vec<crate::services::BreakerReport>,
}

/// Aggregate view of the whole background fabric
pub async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        workers: state.orchestrator.status().await,
        scheduler: state.coordinator.scheduler_snapshot().await,
        queue: state.work_queue.queue_depths().await?,
        downloads: state.downloads.counts_by_status().await?,
        library: state.library.stats().await?,
        circuit_breakers: state.breakers.reports(),
    }))
}

/// Prometheus text exposition
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

/// Manual "run now" for a coordinator task. Bypasses the cooldown, refuses
/// to overlap an in-flight run.
pub async fn run_task_handler(
    State(state): State<AppState>,
    Path(task): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let task: WorkItemType = task
        .parse()
        .map_err(|e: String| AppError::Validation(e))?;

    let item = state.coordinator.run_now(task).await?;
    Ok(Json(serde_json::json!({
        "work_item_id": item.id,
        "task": task.to_string(),
        "status": item.status.to_string(),
    })))
}
