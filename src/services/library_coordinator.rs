//! Unified library coordinator: one long-running actor owning all periodic
//! sync, enrichment and cleanup work.
//!
//! The coordinator never does the work itself. Its scheduler decides which
//! task types are due (cooldown elapsed, no run already in flight) and
//! enqueues a work item per firing; the handlers registered here do the
//! actual work inside the queue's worker pool, which also gives every task
//! the queue's retry and crash-recovery semantics for free.
//!
//! Every handler is idempotent: all writes are upserts on stable natural
//! keys, so re-running a task can never duplicate entities.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::download_client::SourceResolver;
use super::import_source::{ImportSource, MetadataEnricher};
use super::orchestrator::BackgroundWorker;
use super::session_store::SessionStore;
use super::work_queue::{HandlerOutcome, WorkItemHandler, WorkQueueService};
use crate::config::{LibrarySettings, QueueSettings};
use crate::error::{AppError, Result};
use crate::models::download::Download;
use crate::models::library::OwnershipState;
use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemType};
use crate::repositories::blocklist::BlocklistStore;
use crate::repositories::downloads::DownloadStore;
use crate::repositories::library::LibraryStore;
use crate::repositories::tokens::SettingsStore;

/// Scheduler priority for a task type, mapped onto work-item priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_work_item_priority(&self) -> i32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 5,
            TaskPriority::High => 10,
        }
    }
}

/// The task types the coordinator schedules
pub const COORDINATED_TASKS: [WorkItemType; 6] = [
    WorkItemType::ArtistSync,
    WorkItemType::AlbumSync,
    WorkItemType::TrackSync,
    WorkItemType::Enrichment,
    WorkItemType::DownloadRequest,
    WorkItemType::Cleanup,
];

#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub cooldown: std::time::Duration,
    pub priority: TaskPriority,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

/// Point-in-time view of one scheduled task, for the status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskReport {
    pub task: String,
    pub priority: TaskPriority,
    pub cooldown_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

/// Pure scheduling state: cooldowns, priorities, and in-flight flags.
/// At startup every task type is due.
pub struct TaskScheduler {
    entries: HashMap<WorkItemType, TaskEntry>,
}

impl TaskScheduler {
    pub fn new(settings: &LibrarySettings) -> Self {
        let mut entries = HashMap::new();
        for task in COORDINATED_TASKS {
            let (cooldown, priority) = match task {
                WorkItemType::ArtistSync => (settings.sync_cooldown, TaskPriority::High),
                WorkItemType::AlbumSync => (settings.sync_cooldown, TaskPriority::Normal),
                WorkItemType::TrackSync => (settings.sync_cooldown, TaskPriority::Normal),
                WorkItemType::Enrichment => (settings.sync_cooldown, TaskPriority::Low),
                WorkItemType::DownloadRequest => (settings.sync_cooldown, TaskPriority::High),
                // Cleanup has no reason to run as often as the syncs
                WorkItemType::Cleanup => (settings.sync_cooldown * 6, TaskPriority::Low),
                _ => unreachable!(),
            };
            entries.insert(
                task,
                TaskEntry {
                    cooldown,
                    priority,
                    last_run_at: None,
                    is_running: false,
                },
            );
        }
        Self { entries }
    }

    pub fn is_due(&self, task: WorkItemType, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get(&task) else {
            return false;
        };
        if entry.is_running {
            return false;
        }
        match entry.last_run_at {
            None => true,
            Some(last) => {
                let cooldown = chrono::Duration::from_std(entry.cooldown)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5));
                now - last >= cooldown
            }
        }
    }

    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<(WorkItemType, TaskPriority)> {
        COORDINATED_TASKS
            .iter()
            .filter(|task| self.is_due(**task, now))
            .map(|task| (*task, self.entries[task].priority))
            .collect()
    }

    pub fn mark_dispatched(&mut self, task: WorkItemType) {
        if let Some(entry) = self.entries.get_mut(&task) {
            entry.is_running = true;
        }
    }

    pub fn mark_finished(&mut self, task: WorkItemType, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(&task) {
            entry.is_running = false;
            entry.last_run_at = Some(now);
        }
    }

    /// Reconcile the in-flight flag against the queue's view. Heals the flag
    /// if a dispatched item was cancelled before its handler ever ran.
    pub fn sync_running(&mut self, task: WorkItemType, queue_has_active: bool) {
        if let Some(entry) = self.entries.get_mut(&task) {
            if entry.is_running && !queue_has_active {
                entry.is_running = false;
            }
        }
    }

    pub fn is_running(&self, task: WorkItemType) -> bool {
        self.entries
            .get(&task)
            .map(|e| e.is_running)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<TaskReport> {
        let mut reports: Vec<TaskReport> = COORDINATED_TASKS
            .iter()
            .map(|task| {
                let entry = &self.entries[task];
                TaskReport {
                    task: task.to_string(),
                    priority: entry.priority,
                    cooldown_secs: entry.cooldown.as_secs(),
                    last_run_at: entry.last_run_at,
                    is_running: entry.is_running,
                }
            })
            .collect();
        reports.sort_by(|a, b| a.task.cmp(&b.task));
        reports
    }
}

/// Everything the coordinator's task handlers need
pub struct CoordinatorDeps {
    pub library: Arc<dyn LibraryStore>,
    pub downloads: Arc<dyn DownloadStore>,
    pub blocklist: Arc<dyn BlocklistStore>,
    pub sessions: Arc<SessionStore>,
    pub sources: Vec<Arc<dyn ImportSource>>,
    pub enrichers: Vec<Arc<dyn MetadataEnricher>>,
    pub source_resolver: Arc<dyn SourceResolver>,
}

pub struct UnifiedLibraryCoordinator {
    queue: Arc<WorkQueueService>,
    settings_store: Arc<dyn SettingsStore>,
    scheduler: Arc<Mutex<TaskScheduler>>,
    library_settings: LibrarySettings,
}

impl UnifiedLibraryCoordinator {
    pub fn new(
        queue: Arc<WorkQueueService>,
        settings_store: Arc<dyn SettingsStore>,
        library_settings: LibrarySettings,
    ) -> Self {
        let scheduler = Arc::new(Mutex::new(TaskScheduler::new(&library_settings)));
        Self {
            queue,
            settings_store,
            scheduler,
            library_settings,
        }
    }

    /// Register all task handlers with the queue. Must run before
    /// `start_all` brings the worker pool up.
    pub async fn register_handlers(
        &self,
        deps: CoordinatorDeps,
        queue_settings: &QueueSettings,
    ) -> Result<()> {
        let handlers: Vec<(WorkItemType, Arc<dyn WorkItemHandler>)> = vec![
            (
                WorkItemType::ArtistSync,
                Arc::new(ArtistSyncHandler {
                    library: Arc::clone(&deps.library),
                    sources: deps.sources.clone(),
                }),
            ),
            (
                WorkItemType::AlbumSync,
                Arc::new(AlbumSyncHandler {
                    library: Arc::clone(&deps.library),
                    sources: deps.sources.clone(),
                    batch_size: self.library_settings.enrichment_batch_size,
                }),
            ),
            (
                WorkItemType::TrackSync,
                Arc::new(TrackSyncHandler {
                    library: Arc::clone(&deps.library),
                    sources: deps.sources.clone(),
                    batch_size: self.library_settings.enrichment_batch_size,
                    auto_queue_downloads: self.library_settings.auto_queue_downloads,
                }),
            ),
            (
                WorkItemType::Enrichment,
                Arc::new(EnrichmentHandler {
                    library: Arc::clone(&deps.library),
                    enrichers: deps.enrichers.clone(),
                    batch_size: self.library_settings.enrichment_batch_size,
                }),
            ),
            (
                WorkItemType::DownloadRequest,
                Arc::new(DownloadRequestHandler {
                    library: Arc::clone(&deps.library),
                    downloads: Arc::clone(&deps.downloads),
                    source_resolver: Arc::clone(&deps.source_resolver),
                    max_per_run: queue_settings.max_per_cycle,
                }),
            ),
            (
                WorkItemType::Cleanup,
                Arc::new(CleanupHandler {
                    library: Arc::clone(&deps.library),
                    downloads: Arc::clone(&deps.downloads),
                    blocklist: Arc::clone(&deps.blocklist),
                    sessions: Arc::clone(&deps.sessions),
                    queue: Arc::clone(&self.queue),
                    download_cleanup_days: self.library_settings.download_cleanup_days,
                    stale_lease_threshold: queue_settings.stale_lease_threshold,
                }),
            ),
        ];

        for (task, handler) in handlers {
            let wrapped = Arc::new(ScheduledHandler {
                task,
                inner: handler,
                scheduler: Arc::clone(&self.scheduler),
                settings_store: Arc::clone(&self.settings_store),
            });
            self.queue.register_handler(task, wrapped).await?;
        }
        Ok(())
    }

    /// One scheduler pass: heal in-flight flags against the queue, then
    /// enqueue a work item for every due task.
    pub async fn tick(&self) -> Result<usize> {
        let store = self.queue.store();
        let now = Utc::now();

        let mut scheduler = self.scheduler.lock().await;
        for task in COORDINATED_TASKS {
            let active = store.has_active(task).await?;
            scheduler.sync_running(task, active);
        }

        let due = scheduler.due_tasks(now);
        let mut fired = 0;
        for (task, priority) in due {
            let item = NewWorkItem::new(
                task,
                serde_json::json!({ "triggered_by": "scheduler" }),
            )
            .with_priority(priority.as_work_item_priority());

            self.queue.enqueue(item).await?;
            scheduler.mark_dispatched(task);
            debug!(task = %task, "Scheduled library task");
            fired += 1;
        }
        Ok(fired)
    }

    /// On-demand trigger: bypasses the cooldown but still refuses to overlap
    /// an in-flight run of the same task type.
    pub async fn run_now(&self, task: WorkItemType) -> Result<WorkItem> {
        if !COORDINATED_TASKS.contains(&task) {
            return Err(AppError::Validation(format!(
                "{task} is not a coordinator task"
            )));
        }

        let store = self.queue.store();
        let mut scheduler = self.scheduler.lock().await;
        scheduler.sync_running(task, store.has_active(task).await?);
        if scheduler.is_running(task) {
            return Err(AppError::Validation(format!("{task} is already running")));
        }

        let priority = TaskPriority::High.as_work_item_priority();
        let item = self
            .queue
            .enqueue(
                NewWorkItem::new(task, serde_json::json!({ "triggered_by": "manual" }))
                    .with_priority(priority),
            )
            .await?;
        scheduler.mark_dispatched(task);
        info!(task = %task, work_item = %item.id, "Manually triggered library task");
        Ok(item)
    }

    pub async fn scheduler_snapshot(&self) -> Vec<TaskReport> {
        self.scheduler.lock().await.snapshot()
    }
}

#[async_trait]
impl BackgroundWorker for UnifiedLibraryCoordinator {
    fn name(&self) -> &'static str {
        "library_coordinator"
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.library_settings.use_unified_manager {
            info!("Unified library manager disabled; coordinator idle");
            let _ = shutdown.changed().await;
            return Ok(());
        }

        let mut interval = tokio::time::interval(self.library_settings.tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Coordinator tick failed");
                    }
                }
            }
        }
    }
}

/// Wraps a task handler so that finishing a run (success or failure) clears
/// the scheduler's in-flight flag and stamps `last_run_at`, which is also
/// persisted for operators.
struct ScheduledHandler {
    task: WorkItemType,
    inner: Arc<dyn WorkItemHandler>,
    scheduler: Arc<Mutex<TaskScheduler>>,
    settings_store: Arc<dyn SettingsStore>,
}

#[async_trait]
impl WorkItemHandler for ScheduledHandler {
    async fn handle(&self, item: &WorkItem) -> Result<HandlerOutcome> {
        let result = self.inner.handle(item).await;
        let now = Utc::now();

        self.scheduler.lock().await.mark_finished(self.task, now);

        let key = format!("library.task.{}.last_run_at", self.task);
        if let Err(e) = self.settings_store.set(&key, &now.to_rfc3339()).await {
            warn!(task = %self.task, error = %e, "Could not persist task run time");
        }

        result
    }
}

// --- Task handlers -------------------------------------------------------

/// Pulls followed artists from every available source and reconciles them
/// into the local artist table as `owned`.
struct ArtistSyncHandler {
    library: Arc<dyn LibraryStore>,
    sources: Vec<Arc<dyn ImportSource>>,
}

#[async_trait]
impl WorkItemHandler for ArtistSyncHandler {
    async fn handle(&self, _item: &WorkItem) -> Result<HandlerOutcome> {
        let mut synced = 0u64;
        let mut sources_used = Vec::new();
        let mut skipped_reauth = false;

        for source in &self.sources {
            if !source.is_available().await {
                debug!(source = source.name(), "Import source unavailable");
                continue;
            }

            let mut stream = match source.import_artists().await {
                Ok(stream) => stream,
                Err(AppError::NeedsReauthentication { .. }) => {
                    // Not our problem to fix; the UI shows the re-login banner
                    skipped_reauth = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            while let Some(batch) = stream.next().await {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(AppError::NeedsReauthentication { .. }) => {
                        skipped_reauth = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                for artist in &batch {
                    self.library
                        .upsert_artist(source.name(), artist, OwnershipState::Owned)
                        .await?;
                    synced += 1;
                }
            }
            sources_used.push(source.name().to_string());
        }

        let mut result = serde_json::json!({
            "artists_synced": synced,
            "sources": sources_used,
        });
        if skipped_reauth {
            result["skipped"] = serde_json::json!("needs_reauth");
        }
        Ok(HandlerOutcome::Completed(result))
    }
}

/// Expands owned artists into albums
struct AlbumSyncHandler {
    library: Arc<dyn LibraryStore>,
    sources: Vec<Arc<dyn ImportSource>>,
    batch_size: usize,
}

#[async_trait]
impl WorkItemHandler for AlbumSyncHandler {
    async fn handle(&self, _item: &WorkItem) -> Result<HandlerOutcome> {
        let artists = self.library.owned_artists(self.batch_size as i64).await?;
        let mut synced = 0u64;
        let mut skipped_reauth = false;

        for artist in &artists {
            for source in &self.sources {
                let Some(external_id) = artist.external_ids.get(source.name()) else {
                    continue;
                };
                if !source.is_available().await {
                    continue;
                }

                let albums = match source
                    .import_albums_for_artist(external_id, Some(&artist.name))
                    .await
                {
                    Ok(albums) => albums,
                    Err(AppError::NeedsReauthentication { .. }) => {
                        skipped_reauth = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                for album in &albums {
                    self.library
                        .upsert_album(source.name(), artist.id, album)
                        .await?;
                    synced += 1;
                }
            }
        }

        let mut result = serde_json::json!({
            "albums_synced": synced,
            "artists_considered": artists.len(),
        });
        if skipped_reauth {
            result["skipped"] = serde_json::json!("needs_reauth");
        }
        Ok(HandlerOutcome::Completed(result))
    }
}

/// Expands owned albums into tracks. New tracks arrive as `not_needed`
/// unless auto-queuing is on, in which case they go straight to `pending`
/// for the download-request sweep.
struct TrackSyncHandler {
    library: Arc<dyn LibraryStore>,
    sources: Vec<Arc<dyn ImportSource>>,
    batch_size: usize,
    auto_queue_downloads: bool,
}

#[async_trait]
impl WorkItemHandler for TrackSyncHandler {
    async fn handle(&self, _item: &WorkItem) -> Result<HandlerOutcome> {
        let albums = self.library.owned_albums(self.batch_size as i64).await?;
        let mut synced = 0u64;
        let mut queued = 0u64;
        let mut skipped_reauth = false;

        for album in &albums {
            for source in &self.sources {
                let Some(external_id) = album.external_ids.get(source.name()) else {
                    continue;
                };
                if !source.is_available().await {
                    continue;
                }

                let tracks = match source.import_tracks_for_album(external_id).await {
                    Ok(tracks) => tracks,
                    Err(AppError::NeedsReauthentication { .. }) => {
                        skipped_reauth = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                for track in &tracks {
                    let (stored, created) = self
                        .library
                        .upsert_track(source.name(), album.id, album.artist_id, track)
                        .await?;
                    synced += 1;

                    if created && stored.file_path.is_none() && self.auto_queue_downloads {
                        self.library
                            .set_track_download_state(
                                stored.id,
                                crate::models::library::TrackDownloadState::Pending,
                            )
                            .await?;
                        queued += 1;
                    }
                }
            }
        }

        let mut result = serde_json::json!({
            "tracks_synced": synced,
            "tracks_queued": queued,
            "albums_considered": albums.len(),
        });
        if skipped_reauth {
            result["skipped"] = serde_json::json!("needs_reauth");
        }
        Ok(HandlerOutcome::Completed(result))
    }
}

/// Attaches missing artwork from enrichment providers, first provider with
/// an answer wins. Batched to respect upstream rate limits.
struct EnrichmentHandler {
    library: Arc<dyn LibraryStore>,
    enrichers: Vec<Arc<dyn MetadataEnricher>>,
    batch_size: usize,
}

#[async_trait]
impl WorkItemHandler for EnrichmentHandler {
    async fn handle(&self, _item: &WorkItem) -> Result<HandlerOutcome> {
        let mut artists_enriched = 0u64;
        let mut albums_enriched = 0u64;
        let mut provider_errors = 0u64;

        let artists = self
            .library
            .artists_missing_artwork(self.batch_size as i64)
            .await?;
        for artist in &artists {
            for enricher in &self.enrichers {
                match enricher.enrich_artist(artist).await {
                    Ok(Some(enrichment)) => {
                        if let Some(url) = enrichment.artwork_url {
                            self.library.set_artist_artwork(artist.id, &url).await?;
                            artists_enriched += 1;
                        }
                        break;
                    }
                    Ok(None) => continue,
                    Err(AppError::NeedsReauthentication { .. }) => continue,
                    Err(e) => {
                        // One flaky provider must not starve the others
                        debug!(enricher = enricher.name(), error = %e, "Artist enrichment failed");
                        provider_errors += 1;
                        continue;
                    }
                }
            }
        }

        let albums = self
            .library
            .albums_missing_artwork(self.batch_size as i64)
            .await?;
        for album in &albums {
            for enricher in &self.enrichers {
                match enricher.enrich_album(album).await {
                    Ok(Some(enrichment)) => {
                        if let Some(url) = enrichment.artwork_url {
                            self.library.set_album_artwork(album.id, &url).await?;
                            albums_enriched += 1;
                        }
                        break;
                    }
                    Ok(None) => continue,
                    Err(AppError::NeedsReauthentication { .. }) => continue,
                    Err(e) => {
                        debug!(enricher = enricher.name(), error = %e, "Album enrichment failed");
                        provider_errors += 1;
                        continue;
                    }
                }
            }
        }

        Ok(HandlerOutcome::Completed(serde_json::json!({
            "artists_enriched": artists_enriched,
            "albums_enriched": albums_enriched,
            "provider_errors": provider_errors,
        })))
    }
}

/// Turns `pending` tracks into `waiting` downloads once the search layer
/// can name a source for them.
struct DownloadRequestHandler {
    library: Arc<dyn LibraryStore>,
    downloads: Arc<dyn DownloadStore>,
    source_resolver: Arc<dyn SourceResolver>,
    max_per_run: usize,
}

#[async_trait]
impl WorkItemHandler for DownloadRequestHandler {
    async fn handle(&self, _item: &WorkItem) -> Result<HandlerOutcome> {
        let tracks = self
            .library
            .tracks_pending_download(self.max_per_run as i64)
            .await?;

        let mut created = 0u64;
        let mut unresolved = 0u64;

        for track in &tracks {
            if self.downloads.has_active_for_track(track.id).await? {
                continue;
            }

            match self.source_resolver.resolve(track).await? {
                Some(source) => {
                    let download = Download::new(track.id, source.username, source.filename);
                    self.downloads.insert(&download).await?;
                    info!(track = %track.id, download = %download.id, "Created download for track");
                    created += 1;
                }
                None => {
                    // No candidate yet; the track stays pending for later sweeps
                    unresolved += 1;
                }
            }
        }

        Ok(HandlerOutcome::Completed(serde_json::json!({
            "downloads_created": created,
            "unresolved": unresolved,
            "tracks_considered": tracks.len(),
        })))
    }
}

/// Housekeeping: orphan purge, blocklist expiry, failed-download reset,
/// stale-lease sweep, session eviction.
struct CleanupHandler {
    library: Arc<dyn LibraryStore>,
    downloads: Arc<dyn DownloadStore>,
    blocklist: Arc<dyn BlocklistStore>,
    sessions: Arc<SessionStore>,
    queue: Arc<WorkQueueService>,
    download_cleanup_days: u32,
    stale_lease_threshold: std::time::Duration,
}

#[async_trait]
impl WorkItemHandler for CleanupHandler {
    async fn handle(&self, _item: &WorkItem) -> Result<HandlerOutcome> {
        let now = Utc::now();

        let (albums_purged, artists_purged) = self.library.purge_orphans().await?;
        let blocklist_expired = self.blocklist.delete_expired(now).await?;

        // 0 = never reset failed downloads
        let downloads_reset = if self.download_cleanup_days > 0 {
            let cutoff = now - chrono::Duration::days(self.download_cleanup_days as i64);
            self.downloads.reset_old_failed(cutoff).await?
        } else {
            0
        };

        let stale_items = self.queue.cleanup_stale(self.stale_lease_threshold).await?;
        let sessions_purged = self.sessions.purge_expired().await;

        info!(
            albums_purged,
            artists_purged,
            blocklist_expired,
            downloads_reset,
            stale_items = stale_items.len(),
            sessions_purged,
            "Cleanup pass finished"
        );

        Ok(HandlerOutcome::Completed(serde_json::json!({
            "albums_purged": albums_purged,
            "artists_purged": artists_purged,
            "blocklist_expired": blocklist_expired,
            "downloads_reset": downloads_reset,
            "stale_work_items": stale_items.len(),
            "sessions_purged": sessions_purged,
        })))
    }
}
