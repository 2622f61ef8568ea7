//! Hand-written in-memory fakes for the store and client traits.
//!
//! These mirror the Postgres implementations closely enough for worker
//! tests: lease semantics, ordering, retry backoff and scope matching all
//! behave like the real store, just without a database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use uuid::Uuid;

use music_library_manager_backend::error::{AppError, Result};
use music_library_manager_backend::models::blocklist::BlocklistEntry;
use music_library_manager_backend::models::download::{Download, DownloadStatus};
use music_library_manager_backend::models::library::{
    normalize_name, Album, Artist, ImportedAlbum, ImportedArtist, ImportedPlaylist, ImportedTrack,
    OwnershipState, Track, TrackDownloadState,
};
use music_library_manager_backend::models::token::{ServiceKind, ServiceToken, TokenResponse};
use music_library_manager_backend::models::work_item::{
    retry_backoff, NewWorkItem, WorkItem, WorkItemStatus, WorkItemType,
};
use music_library_manager_backend::repositories::blocklist::BlocklistStore;
use music_library_manager_backend::repositories::downloads::{
    DownloadCount, DownloadStore, FailureGroup,
};
use music_library_manager_backend::repositories::library::{LibraryStats, LibraryStore};
use music_library_manager_backend::repositories::tokens::{SettingsStore, TokenStore};
use music_library_manager_backend::repositories::work_items::{
    QueueDepth, WorkItemFilter, WorkItemStore,
};
use music_library_manager_backend::services::download_client::{
    ExternalDownload, ExternalDownloadClient, ResolvedSource, SourceResolver,
};
use music_library_manager_backend::services::import_source::{
    AlbumEnrichment, ArtistEnrichment, ImportSource, ImportStream, MetadataEnricher,
};
use music_library_manager_backend::services::oauth_endpoint::AuthorizationEndpoint;

// --- Work items ----------------------------------------------------------

#[derive(Default)]
pub struct InMemoryWorkItemStore {
    items: Mutex<HashMap<Uuid, WorkItem>>,
}

impl InMemoryWorkItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<WorkItem> {
        self.items.lock().unwrap().values().cloned().collect()
    }

    /// Test helper: rewrite a stored item in place
    pub fn mutate<F: FnOnce(&mut WorkItem)>(&self, id: Uuid, f: F) {
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.get_mut(&id) {
            f(item);
        }
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn insert(&self, item: NewWorkItem) -> Result<WorkItem> {
        let work_item = WorkItem {
            id: Uuid::new_v4(),
            job_type: item.job_type,
            status: WorkItemStatus::Pending,
            priority: item.priority,
            payload: item.payload,
            result: None,
            error: None,
            retries: 0,
            max_retries: item.max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            locked_by: None,
            locked_at: None,
            next_run_at: item.run_at,
        };
        self.items
            .lock()
            .unwrap()
            .insert(work_item.id, work_item.clone());
        Ok(work_item)
    }

    async fn acquire_next(
        &self,
        worker_id: &str,
        types: &[WorkItemType],
    ) -> Result<Option<WorkItem>> {
        let now = Utc::now();
        let mut items = self.items.lock().unwrap();

        let mut candidates: Vec<&WorkItem> = items
            .values()
            .filter(|i| {
                i.status == WorkItemStatus::Pending
                    && types.contains(&i.job_type)
                    && i.next_run_at.map(|at| at <= now).unwrap_or(true)
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let Some(id) = candidates.first().map(|i| i.id) else {
            return Ok(None);
        };
        let item = items.get_mut(&id).unwrap();
        item.status = WorkItemStatus::Running;
        item.locked_by = Some(worker_id.to_string());
        item.locked_at = Some(now);
        item.started_at.get_or_insert(now);
        Ok(Some(item.clone()))
    }

    async fn complete(&self, id: Uuid, worker_id: &str, result: serde_json::Value) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        let item = items.get_mut(&id).ok_or_else(|| AppError::NotFound {
            resource: format!("work item {id}"),
        })?;
        if item.status != WorkItemStatus::Running || item.locked_by.as_deref() != Some(worker_id) {
            return Err(AppError::InvalidTransition {
                from: "not running or not leased by caller".into(),
                to: "completed".into(),
            });
        }
        item.status = WorkItemStatus::Completed;
        item.result = Some(result);
        item.completed_at = Some(Utc::now());
        item.locked_by = None;
        item.locked_at = None;
        Ok(())
    }

    async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> Result<WorkItemStatus> {
        let mut items = self.items.lock().unwrap();
        let item = items.get_mut(&id).ok_or_else(|| AppError::NotFound {
            resource: format!("work item {id}"),
        })?;
        if item.status != WorkItemStatus::Running || item.locked_by.as_deref() != Some(worker_id) {
            return Err(AppError::InvalidTransition {
                from: "not running or not leased by caller".into(),
                to: "failed".into(),
            });
        }

        item.error = Some(error.to_string());
        item.locked_by = None;
        item.locked_at = None;
        if item.retries < item.max_retries {
            item.retries += 1;
            item.status = WorkItemStatus::Pending;
            item.next_run_at = Some(Utc::now() + retry_backoff(item.retries));
            Ok(WorkItemStatus::Pending)
        } else {
            item.status = WorkItemStatus::Failed;
            item.completed_at = Some(Utc::now());
            Ok(WorkItemStatus::Failed)
        }
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        let item = items.get_mut(&id).ok_or_else(|| AppError::NotFound {
            resource: format!("work item {id}"),
        })?;
        match item.status {
            WorkItemStatus::Cancelled => Ok(()),
            status if status.is_terminal() => Err(AppError::InvalidTransition {
                from: status.to_string(),
                to: WorkItemStatus::Cancelled.to_string(),
            }),
            _ => {
                item.status = WorkItemStatus::Cancelled;
                item.completed_at = Some(Utc::now());
                item.locked_by = None;
                item.locked_at = None;
                Ok(())
            }
        }
    }

    async fn release_stale(&self, threshold: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - threshold;
        let mut reclaimed = Vec::new();
        let mut items = self.items.lock().unwrap();
        for item in items.values_mut() {
            if item.status == WorkItemStatus::Running
                && item.locked_at.map(|at| at < cutoff).unwrap_or(false)
            {
                item.status = WorkItemStatus::Pending;
                item.locked_by = None;
                item.locked_at = None;
                reclaimed.push(item.id);
            }
        }
        Ok(reclaimed)
    }

    async fn settle_completed(&self, id: Uuid, result: serde_json::Value) -> Result<bool> {
        let mut items = self.items.lock().unwrap();
        let Some(item) = items.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(
            item.status,
            WorkItemStatus::Running | WorkItemStatus::Pending
        ) {
            return Ok(false);
        }
        item.status = WorkItemStatus::Completed;
        item.result = Some(result);
        item.completed_at = Some(Utc::now());
        item.locked_by = None;
        item.locked_at = None;
        Ok(true)
    }

    async fn settle_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let mut items = self.items.lock().unwrap();
        let Some(item) = items.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(
            item.status,
            WorkItemStatus::Running | WorkItemStatus::Pending
        ) {
            return Ok(false);
        }
        item.status = WorkItemStatus::Failed;
        item.error = Some(error.to_string());
        item.completed_at = Some(Utc::now());
        item.locked_by = None;
        item.locked_at = None;
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>> {
        Ok(self.items.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, filter: WorkItemFilter) -> Result<Vec<WorkItem>> {
        let items = self.items.lock().unwrap();
        let mut matched: Vec<WorkItem> = items
            .values()
            .filter(|i| filter.status.map(|s| i.status == s).unwrap_or(true))
            .filter(|i| filter.job_type.map(|t| i.job_type == t).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn find_active_dispatch(&self, download_id: Uuid) -> Result<Option<WorkItem>> {
        let items = self.items.lock().unwrap();
        let mut matched: Vec<&WorkItem> = items
            .values()
            .filter(|i| {
                i.job_type == WorkItemType::DownloadDispatch
                    && matches!(i.status, WorkItemStatus::Pending | WorkItemStatus::Running)
                    && i.payload.get("download_id").and_then(|v| v.as_str())
                        == Some(download_id.to_string().as_str())
            })
            .collect();
        matched.sort_by_key(|i| i.created_at);
        Ok(matched.first().map(|i| (*i).clone()))
    }

    async fn has_active(&self, job_type: WorkItemType) -> Result<bool> {
        Ok(self.items.lock().unwrap().values().any(|i| {
            i.job_type == job_type
                && matches!(i.status, WorkItemStatus::Pending | WorkItemStatus::Running)
        }))
    }

    async fn queue_depths(&self) -> Result<Vec<QueueDepth>> {
        let items = self.items.lock().unwrap();
        let mut counts: HashMap<(String, String), i64> = HashMap::new();
        for item in items.values() {
            *counts
                .entry((item.job_type.to_string(), item.status.to_string()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((job_type, status), count)| QueueDepth {
                job_type,
                status,
                count,
            })
            .collect())
    }
}

// --- Downloads -----------------------------------------------------------

pub struct InMemoryDownloadStore {
    downloads: Mutex<HashMap<Uuid, Download>>,
    jobs: Arc<InMemoryWorkItemStore>,
    library: Mutex<Option<Arc<InMemoryLibraryStore>>>,
}

impl InMemoryDownloadStore {
    pub fn new(jobs: Arc<InMemoryWorkItemStore>) -> Self {
        Self {
            downloads: Mutex::new(HashMap::new()),
            jobs,
            library: Mutex::new(None),
        }
    }

    pub fn attach_library(&self, library: Arc<InMemoryLibraryStore>) {
        *self.library.lock().unwrap() = Some(library);
    }

    pub fn all(&self) -> Vec<Download> {
        self.downloads.lock().unwrap().values().cloned().collect()
    }

    pub fn mutate<F: FnOnce(&mut Download)>(&self, id: Uuid, f: F) {
        let mut downloads = self.downloads.lock().unwrap();
        if let Some(download) = downloads.get_mut(&id) {
            f(download);
        }
    }
}

#[async_trait]
impl DownloadStore for InMemoryDownloadStore {
    async fn insert(&self, download: &Download) -> Result<()> {
        self.downloads
            .lock()
            .unwrap()
            .insert(download.id, download.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Download>> {
        Ok(self.downloads.lock().unwrap().get(&id).cloned())
    }

    async fn update(&self, download: &Download) -> Result<()> {
        let mut downloads = self.downloads.lock().unwrap();
        if !downloads.contains_key(&download.id) {
            return Err(AppError::NotFound {
                resource: format!("download {}", download.id),
            });
        }
        downloads.insert(download.id, download.clone());
        Ok(())
    }

    async fn list_waiting(&self, limit: i64) -> Result<Vec<Download>> {
        let downloads = self.downloads.lock().unwrap();
        let mut waiting: Vec<Download> = downloads
            .values()
            .filter(|d| d.status == DownloadStatus::Waiting)
            .cloned()
            .collect();
        waiting.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        waiting.truncate(limit as usize);
        Ok(waiting)
    }

    async fn promote_to_pending(
        &self,
        download_id: Uuid,
        dispatch: NewWorkItem,
    ) -> Result<WorkItem> {
        {
            let mut downloads = self.downloads.lock().unwrap();
            let download = downloads.get_mut(&download_id).ok_or_else(|| {
                AppError::NotFound {
                    resource: format!("download {download_id}"),
                }
            })?;
            if download.status != DownloadStatus::Waiting {
                return Err(AppError::InvalidTransition {
                    from: "not waiting".into(),
                    to: DownloadStatus::Pending.to_string(),
                });
            }
            download.status = DownloadStatus::Pending;
        }
        self.jobs.insert(dispatch).await
    }

    async fn list_retry_eligible(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Download>> {
        let downloads = self.downloads.lock().unwrap();
        let mut eligible: Vec<Download> = downloads
            .values()
            .filter(|d| {
                d.status == DownloadStatus::Failed
                    && d.retry_count <= d.max_retries
                    && d.next_retry_at.map(|at| at <= now).unwrap_or(false)
                    && d.last_error_code.map(|c| c.is_retryable()).unwrap_or(true)
            })
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.next_retry_at.cmp(&b.next_retry_at))
        });
        eligible.truncate(limit as usize);
        Ok(eligible)
    }

    async fn find_by_external(
        &self,
        external_id: &str,
        username: Option<&str>,
        filename: &str,
    ) -> Result<Option<Download>> {
        let downloads = self.downloads.lock().unwrap();
        let by_id = downloads
            .values()
            .find(|d| d.external_id.as_deref() == Some(external_id));
        if let Some(found) = by_id {
            return Ok(Some(found.clone()));
        }
        Ok(downloads
            .values()
            .find(|d| {
                d.external_id.is_none()
                    && d.username.as_deref() == username
                    && d.filename.as_deref() == Some(filename)
            })
            .cloned())
    }

    async fn has_active_for_track(&self, track_id: Uuid) -> Result<bool> {
        Ok(self
            .downloads
            .lock()
            .unwrap()
            .values()
            .any(|d| d.track_id == track_id && !d.status.is_terminal()))
    }

    async fn failure_groups(
        &self,
        window_start: DateTime<Utc>,
        threshold: i64,
    ) -> Result<Vec<FailureGroup>> {
        let downloads = self.downloads.lock().unwrap();
        let mut groups: HashMap<(String, String), Vec<&Download>> = HashMap::new();
        for download in downloads.values() {
            if download.status != DownloadStatus::Failed {
                continue;
            }
            let (Some(username), Some(filename)) = (&download.username, &download.filename) else {
                continue;
            };
            if download.started_at.unwrap_or(download.created_at) < window_start {
                continue;
            }
            groups
                .entry((username.clone(), filename.clone()))
                .or_default()
                .push(download);
        }

        Ok(groups
            .into_iter()
            .filter(|(_, failures)| failures.len() as i64 >= threshold)
            .map(|((username, filename), mut failures)| {
                failures.sort_by_key(|d| d.started_at.unwrap_or(d.created_at));
                FailureGroup {
                    username,
                    filename,
                    failures: failures.len() as i64,
                    last_reason: failures.last().and_then(|d| d.last_error_code),
                }
            })
            .collect())
    }

    async fn blocklist_failed_source(
        &self,
        username: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Vec<Uuid>> {
        let mut affected = Vec::new();
        let mut downloads = self.downloads.lock().unwrap();
        for download in downloads.values_mut() {
            if download.status != DownloadStatus::Failed {
                continue;
            }
            let user_matches = username
                .map(|u| download.username.as_deref() == Some(u))
                .unwrap_or(true);
            let file_matches = filename
                .map(|f| download.filename.as_deref() == Some(f))
                .unwrap_or(true);
            if user_matches && file_matches {
                download.status = DownloadStatus::Blocklisted;
                download.completed_at = Some(Utc::now());
                affected.push(download.id);
            }
        }
        Ok(affected)
    }

    async fn reset_old_failed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut reset_tracks = Vec::new();
        let mut count = 0;
        {
            let mut downloads = self.downloads.lock().unwrap();
            for download in downloads.values_mut() {
                if download.status == DownloadStatus::Failed
                    && download.started_at.unwrap_or(download.created_at) < cutoff
                {
                    download.status = DownloadStatus::Cancelled;
                    download.completed_at = Some(Utc::now());
                    reset_tracks.push(download.track_id);
                    count += 1;
                }
            }
        }
        if let Some(library) = self.library.lock().unwrap().clone() {
            for track_id in reset_tracks {
                library.reset_track_if_failed(track_id);
            }
        }
        Ok(count)
    }

    async fn counts_by_status(&self) -> Result<Vec<DownloadCount>> {
        let downloads = self.downloads.lock().unwrap();
        let mut counts: HashMap<String, i64> = HashMap::new();
        for download in downloads.values() {
            *counts.entry(download.status.to_string()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(status, count)| DownloadCount { status, count })
            .collect())
    }
}

// --- Library -------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLibraryStore {
    artists: Mutex<HashMap<Uuid, Artist>>,
    albums: Mutex<HashMap<Uuid, Album>>,
    tracks: Mutex<HashMap<Uuid, Track>>,
}

impl InMemoryLibraryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artist_count(&self) -> usize {
        self.artists.lock().unwrap().len()
    }

    pub fn album_count(&self) -> usize {
        self.albums.lock().unwrap().len()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().unwrap().len()
    }

    pub fn insert_artist(&self, artist: Artist) {
        self.artists.lock().unwrap().insert(artist.id, artist);
    }

    pub fn insert_album(&self, album: Album) {
        self.albums.lock().unwrap().insert(album.id, album);
    }

    pub fn insert_track(&self, track: Track) {
        self.tracks.lock().unwrap().insert(track.id, track);
    }

    pub fn track(&self, id: Uuid) -> Option<Track> {
        self.tracks.lock().unwrap().get(&id).cloned()
    }

    fn reset_track_if_failed(&self, track_id: Uuid) {
        let mut tracks = self.tracks.lock().unwrap();
        if let Some(track) = tracks.get_mut(&track_id) {
            if track.download_state == TrackDownloadState::Failed {
                track.download_state = TrackDownloadState::NotNeeded;
            }
        }
    }
}

pub fn make_artist(name: &str) -> Artist {
    Artist {
        id: Uuid::new_v4(),
        name: name.to_string(),
        normalized_name: normalize_name(name),
        external_ids: Default::default(),
        ownership_state: OwnershipState::Owned,
        artwork_url: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn make_album(artist_id: Uuid, title: &str) -> Album {
    Album {
        id: Uuid::new_v4(),
        artist_id,
        title: title.to_string(),
        normalized_title: normalize_name(title),
        external_ids: Default::default(),
        ownership_state: OwnershipState::Owned,
        artwork_url: None,
        release_date: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn make_track(album_id: Uuid, artist_id: Uuid, title: &str) -> Track {
    Track {
        id: Uuid::new_v4(),
        album_id,
        artist_id,
        title: title.to_string(),
        normalized_title: normalize_name(title),
        isrc: None,
        track_number: None,
        duration_secs: None,
        external_ids: Default::default(),
        ownership_state: OwnershipState::Owned,
        download_state: TrackDownloadState::NotNeeded,
        file_path: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl LibraryStore for InMemoryLibraryStore {
    async fn upsert_artist(
        &self,
        source: &str,
        artist: &ImportedArtist,
        ownership: OwnershipState,
    ) -> Result<Artist> {
        let normalized = normalize_name(&artist.name);
        let mut artists = self.artists.lock().unwrap();

        let existing_id = artists
            .values()
            .find(|a| {
                a.external_ids.get(source) == Some(&artist.external_id)
                    || a.normalized_name == normalized
            })
            .map(|a| a.id);

        let stored = if let Some(id) = existing_id {
            let entry = artists.get_mut(&id).unwrap();
            entry
                .external_ids
                .insert(source.to_string(), artist.external_id.clone());
            if entry.artwork_url.is_none() {
                entry.artwork_url = artist.artwork_url.clone();
            }
            if entry.ownership_state != OwnershipState::Owned {
                entry.ownership_state = ownership;
            }
            entry.updated_at = Utc::now();
            entry.clone()
        } else {
            let mut entry = make_artist(&artist.name);
            entry
                .external_ids
                .insert(source.to_string(), artist.external_id.clone());
            entry.ownership_state = ownership;
            entry.artwork_url = artist.artwork_url.clone();
            artists.insert(entry.id, entry.clone());
            entry
        };
        Ok(stored)
    }

    async fn upsert_album(
        &self,
        source: &str,
        artist_id: Uuid,
        album: &ImportedAlbum,
    ) -> Result<Album> {
        let normalized = normalize_name(&album.title);
        let mut albums = self.albums.lock().unwrap();

        let existing_id = albums
            .values()
            .find(|a| {
                a.external_ids.get(source) == Some(&album.external_id)
                    || (a.artist_id == artist_id && a.normalized_title == normalized)
            })
            .map(|a| a.id);

        let stored = if let Some(id) = existing_id {
            let entry = albums.get_mut(&id).unwrap();
            entry
                .external_ids
                .insert(source.to_string(), album.external_id.clone());
            if entry.artwork_url.is_none() {
                entry.artwork_url = album.artwork_url.clone();
            }
            entry.updated_at = Utc::now();
            entry.clone()
        } else {
            let mut entry = make_album(artist_id, &album.title);
            entry
                .external_ids
                .insert(source.to_string(), album.external_id.clone());
            entry.artwork_url = album.artwork_url.clone();
            entry.release_date = album.release_date;
            albums.insert(entry.id, entry.clone());
            entry
        };
        Ok(stored)
    }

    async fn upsert_track(
        &self,
        source: &str,
        album_id: Uuid,
        artist_id: Uuid,
        track: &ImportedTrack,
    ) -> Result<(Track, bool)> {
        let normalized = normalize_name(&track.title);
        let mut tracks = self.tracks.lock().unwrap();

        let existing_id = tracks
            .values()
            .find(|t| {
                t.external_ids.get(source) == Some(&track.external_id)
                    || (track.isrc.is_some() && t.isrc == track.isrc)
                    || (t.album_id == album_id
                        && t.normalized_title == normalized
                        && t.track_number == track.track_number)
            })
            .map(|t| t.id);

        if let Some(id) = existing_id {
            let entry = tracks.get_mut(&id).unwrap();
            entry
                .external_ids
                .insert(source.to_string(), track.external_id.clone());
            if entry.isrc.is_none() {
                entry.isrc = track.isrc.clone();
            }
            entry.updated_at = Utc::now();
            Ok((entry.clone(), false))
        } else {
            let mut entry = make_track(album_id, artist_id, &track.title);
            entry
                .external_ids
                .insert(source.to_string(), track.external_id.clone());
            entry.isrc = track.isrc.clone();
            entry.track_number = track.track_number;
            entry.duration_secs = track.duration_secs;
            tracks.insert(entry.id, entry.clone());
            Ok((entry, true))
        }
    }

    async fn owned_artists(&self, limit: i64) -> Result<Vec<Artist>> {
        let artists = self.artists.lock().unwrap();
        let mut owned: Vec<Artist> = artists
            .values()
            .filter(|a| a.ownership_state == OwnershipState::Owned)
            .cloned()
            .collect();
        owned.sort_by_key(|a| a.updated_at);
        owned.truncate(limit as usize);
        Ok(owned)
    }

    async fn owned_albums(&self, limit: i64) -> Result<Vec<Album>> {
        let albums = self.albums.lock().unwrap();
        let mut owned: Vec<Album> = albums
            .values()
            .filter(|a| a.ownership_state == OwnershipState::Owned)
            .cloned()
            .collect();
        owned.sort_by_key(|a| a.updated_at);
        owned.truncate(limit as usize);
        Ok(owned)
    }

    async fn artists_missing_artwork(&self, limit: i64) -> Result<Vec<Artist>> {
        let artists = self.artists.lock().unwrap();
        let mut missing: Vec<Artist> = artists
            .values()
            .filter(|a| a.artwork_url.is_none() && a.ownership_state != OwnershipState::Ignored)
            .cloned()
            .collect();
        missing.sort_by_key(|a| a.created_at);
        missing.truncate(limit as usize);
        Ok(missing)
    }

    async fn albums_missing_artwork(&self, limit: i64) -> Result<Vec<Album>> {
        let albums = self.albums.lock().unwrap();
        let mut missing: Vec<Album> = albums
            .values()
            .filter(|a| a.artwork_url.is_none() && a.ownership_state != OwnershipState::Ignored)
            .cloned()
            .collect();
        missing.sort_by_key(|a| a.created_at);
        missing.truncate(limit as usize);
        Ok(missing)
    }

    async fn set_artist_artwork(&self, artist_id: Uuid, url: &str) -> Result<()> {
        let mut artists = self.artists.lock().unwrap();
        if let Some(artist) = artists.get_mut(&artist_id) {
            artist.artwork_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn set_album_artwork(&self, album_id: Uuid, url: &str) -> Result<()> {
        let mut albums = self.albums.lock().unwrap();
        if let Some(album) = albums.get_mut(&album_id) {
            album.artwork_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn get_track(&self, track_id: Uuid) -> Result<Option<Track>> {
        Ok(self.tracks.lock().unwrap().get(&track_id).cloned())
    }

    async fn tracks_pending_download(&self, limit: i64) -> Result<Vec<Track>> {
        let tracks = self.tracks.lock().unwrap();
        let mut pending: Vec<Track> = tracks
            .values()
            .filter(|t| t.download_state == TrackDownloadState::Pending && t.file_path.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn set_track_download_state(
        &self,
        track_id: Uuid,
        state: TrackDownloadState,
    ) -> Result<()> {
        let mut tracks = self.tracks.lock().unwrap();
        let track = tracks.get_mut(&track_id).ok_or_else(|| AppError::NotFound {
            resource: format!("track {track_id}"),
        })?;
        track.download_state = state;
        Ok(())
    }

    async fn set_track_file(&self, track_id: Uuid, file_path: &str) -> Result<()> {
        let mut tracks = self.tracks.lock().unwrap();
        let track = tracks.get_mut(&track_id).ok_or_else(|| AppError::NotFound {
            resource: format!("track {track_id}"),
        })?;
        track.file_path = Some(file_path.to_string());
        track.download_state = TrackDownloadState::Downloaded;
        Ok(())
    }

    async fn purge_orphans(&self) -> Result<(u64, u64)> {
        let tracks = self.tracks.lock().unwrap();
        let mut albums = self.albums.lock().unwrap();
        let mut artists = self.artists.lock().unwrap();

        let album_ids_with_tracks: Vec<Uuid> = tracks.values().map(|t| t.album_id).collect();
        let before_albums = albums.len();
        albums.retain(|id, _| album_ids_with_tracks.contains(id));

        let artist_ids_in_use: Vec<Uuid> = albums
            .values()
            .map(|a| a.artist_id)
            .chain(tracks.values().map(|t| t.artist_id))
            .collect();
        let before_artists = artists.len();
        artists.retain(|id, _| artist_ids_in_use.contains(id));

        Ok((
            (before_albums - albums.len()) as u64,
            (before_artists - artists.len()) as u64,
        ))
    }

    async fn stats(&self) -> Result<LibraryStats> {
        let tracks = self.tracks.lock().unwrap();
        Ok(LibraryStats {
            artists: self.artists.lock().unwrap().len() as i64,
            albums: self.albums.lock().unwrap().len() as i64,
            tracks: tracks.len() as i64,
            tracks_with_files: tracks.values().filter(|t| t.file_path.is_some()).count() as i64,
        })
    }
}

// --- Blocklist -----------------------------------------------------------

#[derive(Default)]
pub struct InMemoryBlocklistStore {
    entries: Mutex<Vec<BlocklistEntry>>,
}

impl InMemoryBlocklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<BlocklistEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlocklistStore for InMemoryBlocklistStore {
    async fn upsert(&self, entry: &BlocklistEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.username == entry.username && e.filepath == entry.filepath)
        {
            existing.scope = entry.scope;
            existing.reason = entry.reason;
            existing.failure_count = entry.failure_count;
            existing.blocked_at = entry.blocked_at;
            existing.expires_at = entry.expires_at;
        } else {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn find_for_source(
        &self,
        username: Option<&str>,
        filepath: Option<&str>,
    ) -> Result<Option<BlocklistEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.username.as_deref() == username && e.filepath.as_deref() == filepath)
            .cloned())
    }

    async fn is_blocked(
        &self,
        username: &str,
        filepath: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        use music_library_manager_backend::models::blocklist::BlocklistScope;
        Ok(self.entries.lock().unwrap().iter().any(|e| {
            e.is_active(now)
                && match e.scope {
                    BlocklistScope::Username => e.username.as_deref() == Some(username),
                    BlocklistScope::Filepath => e.filepath.as_deref() == Some(filepath),
                    BlocklistScope::Specific => {
                        e.username.as_deref() == Some(username)
                            && e.filepath.as_deref() == Some(filepath)
                    }
                }
        }))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.is_active(now));
        Ok((before - entries.len()) as u64)
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlocklistEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_active(now))
            .cloned()
            .collect())
    }
}

// --- Tokens and settings -------------------------------------------------

#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<HashMap<ServiceKind, ServiceToken>>,
    /// Number of upserts that should fail with a database error first
    pub failing_upserts: AtomicU32,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: ServiceToken) {
        self.tokens.lock().unwrap().insert(token.service, token);
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, service: ServiceKind) -> Result<Option<ServiceToken>> {
        Ok(self.tokens.lock().unwrap().get(&service).cloned())
    }

    async fn upsert(&self, token: &ServiceToken) -> Result<()> {
        if self.failing_upserts.load(Ordering::SeqCst) > 0 {
            self.failing_upserts.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Database(sqlx::Error::PoolClosed));
        }
        self.tokens
            .lock()
            .unwrap()
            .insert(token.service, token.clone());
        Ok(())
    }

    async fn delete(&self, service: ServiceKind) -> Result<()> {
        self.tokens.lock().unwrap().remove(&service);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<ServiceToken>> {
        Ok(self.tokens.lock().unwrap().values().cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemorySettingsStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// --- External download client --------------------------------------------

pub struct FakeDownloadClient {
    pub available: AtomicBool,
    pub fail_listing: AtomicBool,
    pub probes: AtomicU32,
    pub list_calls: AtomicU32,
    transfers: Mutex<Vec<ExternalDownload>>,
    pub enqueued: Mutex<Vec<(String, String)>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl FakeDownloadClient {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            fail_listing: AtomicBool::new(false),
            probes: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            transfers: Mutex::new(Vec::new()),
            enqueued: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Insert or replace a transfer by external id
    pub fn set_transfer(&self, transfer: ExternalDownload) {
        let mut transfers = self.transfers.lock().unwrap();
        if let Some(existing) = transfers
            .iter_mut()
            .find(|t| t.external_id == transfer.external_id)
        {
            *existing = transfer;
        } else {
            transfers.push(transfer);
        }
    }

    pub fn enqueue_count(&self) -> usize {
        self.enqueued.lock().unwrap().len()
    }
}

pub fn transfer(external_id: &str, username: &str, filename: &str, state: &str) -> ExternalDownload {
    ExternalDownload {
        external_id: external_id.to_string(),
        filename: filename.to_string(),
        username: Some(username.to_string()),
        state: state.to_string(),
        bytes_transferred: 0,
        total_bytes: 1024,
        progress_percent: 0.0,
        error_message: None,
    }
}

#[async_trait]
impl ExternalDownloadClient for FakeDownloadClient {
    fn name(&self) -> &str {
        "slskd"
    }

    async fn is_available(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }

    async fn list_downloads(&self) -> Result<Vec<ExternalDownload>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable {
                service: "slskd".into(),
            });
        }
        Ok(self.transfers.lock().unwrap().clone())
    }

    async fn get_download(&self, external_id: &str) -> Result<Option<ExternalDownload>> {
        Ok(self
            .transfers
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.external_id == external_id)
            .cloned())
    }

    async fn enqueue(&self, username: &str, filename: &str) -> Result<String> {
        self.enqueued
            .lock()
            .unwrap()
            .push((username.to_string(), filename.to_string()));
        Ok(format!("{username}/{filename}"))
    }

    async fn cancel(&self, external_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}

// --- Import sources and enrichment ---------------------------------------

pub struct FakeImportSource {
    pub source_name: String,
    pub available: AtomicBool,
    pub needs_reauth: AtomicBool,
    pub artists: Mutex<Vec<ImportedArtist>>,
    pub albums: Mutex<HashMap<String, Vec<ImportedAlbum>>>,
    pub tracks: Mutex<HashMap<String, Vec<ImportedTrack>>>,
}

impl FakeImportSource {
    pub fn new(name: &str) -> Self {
        Self {
            source_name: name.to_string(),
            available: AtomicBool::new(true),
            needs_reauth: AtomicBool::new(false),
            artists: Mutex::new(Vec::new()),
            albums: Mutex::new(HashMap::new()),
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_artists(self, artists: Vec<ImportedArtist>) -> Self {
        *self.artists.lock().unwrap() = artists;
        self
    }

    pub fn add_albums(&self, artist_external_id: &str, albums: Vec<ImportedAlbum>) {
        self.albums
            .lock()
            .unwrap()
            .insert(artist_external_id.to_string(), albums);
    }

    pub fn add_tracks(&self, album_external_id: &str, tracks: Vec<ImportedTrack>) {
        self.tracks
            .lock()
            .unwrap()
            .insert(album_external_id.to_string(), tracks);
    }

    fn reauth_error(&self) -> AppError {
        AppError::NeedsReauthentication {
            service: self.source_name.clone(),
        }
    }
}

#[async_trait]
impl ImportSource for FakeImportSource {
    fn name(&self) -> &str {
        &self.source_name
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn import_artists(&self) -> Result<ImportStream<'_, ImportedArtist>> {
        if self.needs_reauth.load(Ordering::SeqCst) {
            return Err(self.reauth_error());
        }
        let artists = self.artists.lock().unwrap().clone();
        // Two batches to exercise the streaming path
        let mid = artists.len() / 2;
        let batches: Vec<Result<Vec<ImportedArtist>>> = if artists.len() > 1 {
            vec![Ok(artists[..mid].to_vec()), Ok(artists[mid..].to_vec())]
        } else {
            vec![Ok(artists)]
        };
        Ok(futures::stream::iter(batches).boxed())
    }

    async fn import_albums_for_artist(
        &self,
        artist_external_id: &str,
        _artist_name: Option<&str>,
    ) -> Result<Vec<ImportedAlbum>> {
        if self.needs_reauth.load(Ordering::SeqCst) {
            return Err(self.reauth_error());
        }
        Ok(self
            .albums
            .lock()
            .unwrap()
            .get(artist_external_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn import_tracks_for_album(
        &self,
        album_external_id: &str,
    ) -> Result<Vec<ImportedTrack>> {
        if self.needs_reauth.load(Ordering::SeqCst) {
            return Err(self.reauth_error());
        }
        Ok(self
            .tracks
            .lock()
            .unwrap()
            .get(album_external_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn import_playlists(&self) -> Result<Vec<ImportedPlaylist>> {
        Ok(Vec::new())
    }
}

pub struct FakeEnricher {
    pub enricher_name: String,
    pub artist_artwork: Option<String>,
    pub album_artwork: Option<String>,
}

#[async_trait]
impl MetadataEnricher for FakeEnricher {
    fn name(&self) -> &str {
        &self.enricher_name
    }

    async fn enrich_artist(&self, _artist: &Artist) -> Result<Option<ArtistEnrichment>> {
        Ok(self.artist_artwork.clone().map(|url| ArtistEnrichment {
            artwork_url: Some(url),
        }))
    }

    async fn enrich_album(&self, _album: &Album) -> Result<Option<AlbumEnrichment>> {
        Ok(self.album_artwork.clone().map(|url| AlbumEnrichment {
            artwork_url: Some(url),
        }))
    }
}

#[derive(Default)]
pub struct FakeSourceResolver {
    sources: Mutex<HashMap<Uuid, ResolvedSource>>,
}

impl FakeSourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, track_id: Uuid, username: &str, filename: &str) {
        self.sources.lock().unwrap().insert(
            track_id,
            ResolvedSource {
                username: username.to_string(),
                filename: filename.to_string(),
            },
        );
    }
}

#[async_trait]
impl SourceResolver for FakeSourceResolver {
    async fn resolve(&self, track: &Track) -> Result<Option<ResolvedSource>> {
        Ok(self.sources.lock().unwrap().get(&track.id).cloned())
    }
}

// --- OAuth endpoint ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthBehavior {
    Succeed,
    NeedsReauth,
    Transient,
}

pub struct FakeAuthEndpoint {
    pub refresh_calls: AtomicU32,
    pub exchange_calls: AtomicU32,
    pub behavior: Mutex<AuthBehavior>,
    /// Simulated network latency, for single-flight tests
    pub delay: Option<std::time::Duration>,
}

impl FakeAuthEndpoint {
    pub fn new(behavior: AuthBehavior) -> Self {
        Self {
            refresh_calls: AtomicU32::new(0),
            exchange_calls: AtomicU32::new(0),
            behavior: Mutex::new(behavior),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_behavior(&self, behavior: AuthBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn respond(&self, marker: u32) -> Result<TokenResponse> {
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            AuthBehavior::Succeed => Ok(TokenResponse {
                access_token: format!("access-{marker}"),
                refresh_token: Some(format!("refresh-{marker}")),
                expires_in: 3600,
                scope: None,
            }),
            AuthBehavior::NeedsReauth => Err(AppError::NeedsReauthentication {
                service: "spotify".into(),
            }),
            AuthBehavior::Transient => Err(AppError::ServiceUnavailable {
                service: "spotify".into(),
            }),
        }
    }
}

#[async_trait]
impl AuthorizationEndpoint for FakeAuthEndpoint {
    async fn exchange(&self, _code: &str, _pkce_verifier: Option<&str>) -> Result<TokenResponse> {
        let marker = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.respond(marker)
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
        let marker = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.respond(marker)
    }
}

// --- Misc helpers --------------------------------------------------------

pub fn expired_token(service: ServiceKind) -> ServiceToken {
    ServiceToken {
        service,
        access_token: "stale-access".into(),
        refresh_token: Some("stale-refresh".into()),
        expires_at: Utc::now() - Duration::minutes(5),
        scope: None,
        updated_at: Utc::now() - Duration::hours(1),
    }
}

pub fn fresh_token(service: ServiceKind) -> ServiceToken {
    ServiceToken {
        service,
        access_token: "fresh-access".into(),
        refresh_token: Some("fresh-refresh".into()),
        expires_at: Utc::now() + Duration::hours(1),
        scope: None,
        updated_at: Utc::now(),
    }
}
