//! Background-work services and the contracts they consume.

pub mod circuit_breaker;
pub mod download_client;
pub mod download_queue_worker;
pub mod download_status_worker;
pub mod http_pool;
pub mod import_source;
pub mod library_coordinator;
pub mod oauth_endpoint;
pub mod orchestrator;
pub mod session_store;
pub mod slskd_client;
pub mod token_manager;
pub mod work_queue;

pub use circuit_breaker::{
    BreakerReport, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use download_client::{
    map_external_state, ExternalDownload, ExternalDownloadClient, ExternalState, ResolvedSource,
    SourceResolver,
};
pub use download_queue_worker::{
    DispatchPayload, DownloadDispatchHandler, DownloadQueueWorker, QueueWorkerStats,
};
pub use download_status_worker::{DownloadStatusWorker, StatusWorkerStats};
pub use http_pool::HttpClientPool;
pub use import_source::{
    AlbumEnrichment, ArtistEnrichment, ImportSource, ImportStream, MetadataEnricher,
};
pub use library_coordinator::{
    CoordinatorDeps, TaskPriority, TaskReport, TaskScheduler, UnifiedLibraryCoordinator,
    COORDINATED_TASKS,
};
pub use oauth_endpoint::{AuthorizationEndpoint, HttpAuthorizationEndpoint};
pub use orchestrator::{BackgroundWorker, WorkerOrchestrator, WorkerState, WorkerStatusReport};
pub use session_store::SessionStore;
pub use slskd_client::SlskdClient;
pub use token_manager::{TokenManager, TokenRefreshStats, TokenRefreshWorker};
pub use work_queue::{HandlerOutcome, QueueWorkerPool, WorkItemHandler, WorkQueueService};
