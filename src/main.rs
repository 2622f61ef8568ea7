//! Process entry point: wires the stores, services and workers together,
//! brings the orchestrator up, serves the observability endpoints, and
//! tears everything down again on SIGINT/SIGTERM.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use music_library_manager_backend::config::OAuthClientSettings;
use music_library_manager_backend::models::library::Track;
use music_library_manager_backend::models::{ServiceKind, WorkItemType};
use music_library_manager_backend::repositories::{
    PgBlocklistStore, PgDownloadStore, PgLibraryStore, PgSettingsStore, PgTokenStore,
    PgWorkItemStore,
};
use music_library_manager_backend::services::{
    oauth_endpoint::HttpAuthorizationEndpoint, AuthorizationEndpoint, ResolvedSource,
    SourceResolver,
};
use music_library_manager_backend::{
    create_router, AppConfig, AppState, BackgroundWorker, CircuitBreakerRegistry, CoordinatorDeps,
    Database,
    DownloadDispatchHandler, DownloadQueueWorker, DownloadStatusWorker, ExternalDownloadClient,
    HttpClientPool, MetricsCollector, QueueWorkerPool, Result, SessionStore, SlskdClient,
    TokenManager, TokenRefreshWorker, UnifiedLibraryCoordinator, WorkQueueService,
    WorkerOrchestrator,
};

/// Placeholder for the search layer. Until a search backend is wired in,
/// pending tracks simply stay pending.
struct NoSearchBackend;

#[async_trait]
impl SourceResolver for NoSearchBackend {
    async fn resolve(&self, _track: &Track) -> Result<Option<ResolvedSource>> {
        Ok(None)
    }
}

fn endpoint_for(
    http: &HttpClientPool,
    service: ServiceKind,
    settings: &OAuthClientSettings,
) -> Arc<dyn AuthorizationEndpoint> {
    Arc::new(HttpAuthorizationEndpoint::new(
        http.client(),
        service.to_string(),
        settings.token_url.clone(),
        settings.client_id.clone(),
        settings.client_secret.clone(),
        settings.redirect_uri.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!(environment = ?config.environment, "Starting music library manager backend");

    let database = Database::connect(&config.database).await?;
    database.migrate().await?;
    let pool = database.pool();

    let metrics = Arc::new(MetricsCollector::new()?);
    let http_pool = HttpClientPool::new(config.http.clone())?;
    let breakers = Arc::new(CircuitBreakerRegistry::new((&config.circuit_breaker).into()));

    // Repositories
    let work_items = Arc::new(PgWorkItemStore::new(pool.clone()));
    let downloads = Arc::new(PgDownloadStore::new(pool.clone()));
    let blocklist = Arc::new(PgBlocklistStore::new(pool.clone()));
    let library = Arc::new(PgLibraryStore::new(pool.clone()));
    let tokens = Arc::new(PgTokenStore::new(pool.clone()));
    let settings_store = Arc::new(PgSettingsStore::new(pool.clone()));

    // Token management and sessions
    let sessions = Arc::new(SessionStore::new(config.token.session_ttl));
    let mut endpoints = HashMap::new();
    if let Some(settings) = &config.oauth.spotify {
        endpoints.insert(
            ServiceKind::Spotify,
            endpoint_for(&http_pool, ServiceKind::Spotify, settings),
        );
    }
    if let Some(settings) = &config.oauth.deezer {
        endpoints.insert(
            ServiceKind::Deezer,
            endpoint_for(&http_pool, ServiceKind::Deezer, settings),
        );
    }
    let token_manager = Arc::new(TokenManager::new(tokens, endpoints, &config.token));
    let token_worker = Arc::new(TokenRefreshWorker::new(
        Arc::clone(&token_manager),
        Arc::clone(&sessions),
        &config.token,
    ));

    // External download client
    let slskd: Arc<dyn ExternalDownloadClient> =
        Arc::new(SlskdClient::new(http_pool.client(), &config.slskd));

    // Work queue and its worker pool
    let work_queue = Arc::new(
        WorkQueueService::new(work_items.clone()).with_metrics(Arc::clone(&metrics)),
    );
    let queue_pool = Arc::new(QueueWorkerPool::new(Arc::clone(&work_queue), &config.queue));

    // Download lifecycle workers
    let download_queue_worker = Arc::new(
        DownloadQueueWorker::new(
            Arc::clone(&slskd),
            downloads.clone(),
            blocklist.clone(),
            config.queue.clone(),
        )
        .with_metrics(Arc::clone(&metrics)),
    );
    let download_status_worker = Arc::new(
        DownloadStatusWorker::new(
            Arc::clone(&slskd),
            downloads.clone(),
            library.clone(),
            work_items.clone(),
            breakers.get(slskd.name()),
            config.status.clone(),
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    // Coordinator and handler registration (before the pool starts)
    let coordinator = Arc::new(UnifiedLibraryCoordinator::new(
        Arc::clone(&work_queue),
        settings_store.clone(),
        config.library.clone(),
    ));
    work_queue
        .register_handler(
            WorkItemType::DownloadDispatch,
            Arc::new(DownloadDispatchHandler::new(
                Arc::clone(&slskd),
                downloads.clone(),
            )),
        )
        .await?;
    coordinator
        .register_handlers(
            CoordinatorDeps {
                library: library.clone(),
                downloads: downloads.clone(),
                blocklist: blocklist.clone(),
                sessions: Arc::clone(&sessions),
                sources: Vec::new(),
                enrichers: Vec::new(),
                source_resolver: Arc::new(NoSearchBackend),
            },
            &config.queue,
        )
        .await?;

    // Startup order mirrors the dependency chain; shutdown is the reverse
    let orchestrator = Arc::new(WorkerOrchestrator::new(config.server.shutdown_grace));
    orchestrator.register(token_worker).await;
    orchestrator.register(queue_pool).await;
    orchestrator.register(download_queue_worker).await;
    orchestrator.register(download_status_worker).await;
    orchestrator
        .register(Arc::clone(&coordinator) as Arc<dyn BackgroundWorker>)
        .await;
    orchestrator.start_all().await;

    let state = AppState {
        db_pool: pool,
        orchestrator: Arc::clone(&orchestrator),
        coordinator,
        work_queue,
        downloads,
        library,
        breakers,
        metrics,
    };

    let bind_address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "Serving observability endpoints");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down workers");
    orchestrator.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "Could not install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
