//! Music Library Manager Backend
//!
//! The background work fabric of a self-hosted music library manager: a
//! durable work-item queue, the download lifecycle engine and its two
//! workers, a unified library coordinator, server-side token management,
//! and the orchestrator that owns all of their lifecycles. The HTTP surface
//! here is observability only.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod repositories;
pub mod services;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError, Environment};
pub use database::Database;
pub use error::{AppError, ErrorResponse, Result};
pub use metrics::MetricsCollector;
pub use models::*;
pub use repositories::{
    BlocklistStore, DownloadStore, LibraryStore, PgBlocklistStore, PgDownloadStore,
    PgLibraryStore, PgSettingsStore, PgTokenStore, SettingsStore, TokenStore, WorkItemStore,
};
pub use services::{
    BackgroundWorker, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CoordinatorDeps, DownloadDispatchHandler, DownloadQueueWorker, DownloadStatusWorker,
    ExternalDownload, ExternalDownloadClient, HandlerOutcome, HttpClientPool, ImportSource,
    MetadataEnricher, QueueWorkerPool, SessionStore, SlskdClient, SourceResolver, TokenManager,
    TokenRefreshWorker, UnifiedLibraryCoordinator, WorkItemHandler, WorkQueueService,
    WorkerOrchestrator,
};

/// Shared application state for the observability router
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub orchestrator: Arc<WorkerOrchestrator>,
    pub coordinator: Arc<UnifiedLibraryCoordinator>,
    pub work_queue: Arc<WorkQueueService>,
    pub downloads: Arc<dyn DownloadStore>,
    pub library: Arc<dyn LibraryStore>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub metrics: Arc<MetricsCollector>,
}

/// Create the observability router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::monitoring::health_handler))
        .route("/health/ready", get(handlers::monitoring::readiness_handler))
        .route("/status", get(handlers::monitoring::status_handler))
        .route("/metrics", get(handlers::monitoring::metrics_handler))
        .route(
            "/library/tasks/:task/run",
            post(handlers::monitoring::run_task_handler),
        )
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
