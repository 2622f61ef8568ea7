//! Download status worker: the single polling contact point for the
//! external download client.
//!
//! Each cycle fetches every active transfer, matches it to a `Download` row
//! (by external id, falling back to the username/filename fingerprint),
//! applies the state machine, mirrors the outcome onto the dispatch work
//! item, and updates the track's file path on completion. Transfers that
//! stop moving bytes for too long are cancelled and failed as timeouts so
//! the retry path can pick them up.
//!
//! The whole cycle sits behind a named circuit breaker: a dead daemon turns
//! polling into cheap no-ops instead of a log storm.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::download_client::{ExternalDownload, ExternalDownloadClient, ExternalState};
use super::orchestrator::BackgroundWorker;
use crate::config::StatusSettings;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::models::download::{Download, DownloadStatus};
use crate::models::error_codes::DownloadErrorCode;
use crate::repositories::downloads::DownloadStore;
use crate::repositories::library::LibraryStore;
use crate::repositories::work_items::WorkItemStore;

/// Worker-local per-transfer progress memory, used for speed calculation
/// and stale detection. Never persisted.
#[derive(Debug, Clone)]
struct TransferProgress {
    bytes: u64,
    speed_bytes_per_sec: f64,
    last_change: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusWorkerStats {
    pub last_poll_at: Option<DateTime<Utc>>,
    pub polls_total: u64,
    pub transfers_seen: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub stale_cancelled_total: u64,
    pub breaker_skips_total: u64,
}

pub struct DownloadStatusWorker {
    client: Arc<dyn ExternalDownloadClient>,
    downloads: Arc<dyn DownloadStore>,
    library: Arc<dyn LibraryStore>,
    work_items: Arc<dyn WorkItemStore>,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<MetricsCollector>>,
    settings: StatusSettings,
    progress: Mutex<HashMap<String, TransferProgress>>,
    stats: Mutex<StatusWorkerStats>,
}

impl DownloadStatusWorker {
    pub fn new(
        client: Arc<dyn ExternalDownloadClient>,
        downloads: Arc<dyn DownloadStore>,
        library: Arc<dyn LibraryStore>,
        work_items: Arc<dyn WorkItemStore>,
        breaker: Arc<CircuitBreaker>,
        settings: StatusSettings,
    ) -> Self {
        Self {
            client,
            downloads,
            library,
            work_items,
            breaker,
            metrics: None,
            settings,
            progress: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatusWorkerStats::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn stats(&self) -> StatusWorkerStats {
        self.stats.lock().await.clone()
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub async fn run_cycle(&self) -> Result<()> {
        if !self.breaker.can_attempt() {
            // Open circuit: report and do not touch the client at all
            self.stats.lock().await.breaker_skips_total += 1;
            debug!(client = self.client.name(), "Circuit open, skipping status poll");
            self.publish_breaker_metric();
            return Ok(());
        }

        if !self.client.is_available().await {
            self.breaker.record_failure();
            self.publish_breaker_metric();
            debug!(client = self.client.name(), "Download client unavailable");
            return Ok(());
        }

        let transfers = match self.client.list_downloads().await {
            Ok(transfers) => {
                self.breaker.record_success();
                transfers
            }
            Err(e) => {
                self.breaker.record_failure();
                self.publish_breaker_metric();
                warn!(error = %e, "Polling external downloads failed");
                return Ok(());
            }
        };
        self.publish_breaker_metric();

        let now = Utc::now();
        {
            let mut stats = self.stats.lock().await;
            stats.last_poll_at = Some(now);
            stats.polls_total += 1;
            stats.transfers_seen = transfers.len();
        }

        for transfer in &transfers {
            if let Err(e) = self.process_transfer(transfer, now).await {
                warn!(
                    external_id = %transfer.external_id,
                    error = %e,
                    "Failed to reconcile transfer"
                );
            }
        }

        // Forget progress for transfers the client no longer reports
        let seen: std::collections::HashSet<&str> =
            transfers.iter().map(|t| t.external_id.as_str()).collect();
        self.progress
            .lock()
            .await
            .retain(|id, _| seen.contains(id.as_str()));

        Ok(())
    }

    async fn process_transfer(&self, transfer: &ExternalDownload, now: DateTime<Utc>) -> Result<()> {
        let stalled_since = self.track_progress(transfer, now).await;

        let Some(mut download) = self
            .downloads
            .find_by_external(
                &transfer.external_id,
                transfer.username.as_deref(),
                &transfer.filename,
            )
            .await?
        else {
            // Transfers started outside this system are none of our business
            debug!(external_id = %transfer.external_id, "No matching download row");
            return Ok(());
        };

        if !download.status.is_active() {
            return Ok(());
        }

        // Reconcile the external id when we matched by fingerprint
        if download.external_id.as_deref() != Some(transfer.external_id.as_str()) {
            download.external_id = Some(transfer.external_id.clone());
        }

        match transfer.mapped_state() {
            ExternalState::Queued => {
                if download.status == DownloadStatus::Pending {
                    download.transition(DownloadStatus::Queued)?;
                }
                self.downloads.update(&download).await?;
            }
            ExternalState::Downloading => {
                if matches!(
                    download.status,
                    DownloadStatus::Pending | DownloadStatus::Queued
                ) {
                    download.transition(DownloadStatus::Downloading)?;
                }
                download.progress_percent = transfer.progress_percent;
                self.downloads.update(&download).await?;

                // Stale detection: no byte movement for the whole threshold
                if let Some(idle) = stalled_since {
                    if idle >= self.settings.stale_threshold {
                        self.kill_stale_transfer(&mut download, transfer).await?;
                    }
                }
            }
            ExternalState::Completed => {
                self.finish_transfer(&mut download, transfer).await?;
            }
            ExternalState::Failed => {
                let message = transfer
                    .error_message
                    .clone()
                    .unwrap_or_else(|| transfer.state.clone());
                self.fail_download(&mut download, &message).await?;
            }
            ExternalState::Cancelled => {
                download.transition(DownloadStatus::Cancelled)?;
                self.downloads.update(&download).await?;
                self.settle_work_item_failed(&download, "cancelled at external client")
                    .await?;
                info!(download = %download.id, "Download cancelled at external client");
            }
        }

        Ok(())
    }

    /// Update the in-memory byte counters; returns how long the transfer has
    /// gone without progress, if it is being tracked.
    async fn track_progress(
        &self,
        transfer: &ExternalDownload,
        now: DateTime<Utc>,
    ) -> Option<std::time::Duration> {
        let mut progress = self.progress.lock().await;
        match progress.get_mut(&transfer.external_id) {
            Some(entry) => {
                if transfer.bytes_transferred != entry.bytes {
                    let elapsed = (now - entry.last_change).num_milliseconds().max(1) as f64;
                    let delta = transfer.bytes_transferred.saturating_sub(entry.bytes) as f64;
                    entry.speed_bytes_per_sec = delta / (elapsed / 1000.0);
                    entry.bytes = transfer.bytes_transferred;
                    entry.last_change = now;
                    None
                } else {
                    (now - entry.last_change).to_std().ok()
                }
            }
            None => {
                progress.insert(
                    transfer.external_id.clone(),
                    TransferProgress {
                        bytes: transfer.bytes_transferred,
                        speed_bytes_per_sec: 0.0,
                        last_change: now,
                    },
                );
                None
            }
        }
    }

    async fn finish_transfer(
        &self,
        download: &mut Download,
        transfer: &ExternalDownload,
    ) -> Result<()> {
        // The poll can skip straight from queued to completed; walk the
        // machine through downloading so the transition stays legal.
        if matches!(
            download.status,
            DownloadStatus::Pending | DownloadStatus::Queued
        ) {
            download.transition(DownloadStatus::Downloading)?;
        }

        // A completed download must leave a file on the track; failing to
        // record it is a failure of the download itself.
        if let Err(e) = self
            .library
            .set_track_file(download.track_id, &transfer.filename)
            .await
        {
            warn!(download = %download.id, error = %e, "Could not record track file");
            return self
                .fail_with_code(
                    download,
                    DownloadErrorCode::InvalidFile,
                    &format!("could not record downloaded file: {e}"),
                )
                .await;
        }

        download.mark_completed()?;
        self.downloads.update(download).await?;

        if let Some(item) = self.work_items.find_active_dispatch(download.id).await? {
            self.work_items
                .settle_completed(
                    item.id,
                    serde_json::json!({
                        "external_id": download.external_id,
                        "file": transfer.filename,
                    }),
                )
                .await?;
        }

        self.stats.lock().await.completed_total += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_download("completed");
        }
        info!(
            download = %download.id,
            track = %download.track_id,
            file = %transfer.filename,
            "Download completed"
        );
        Ok(())
    }

    async fn fail_download(&self, download: &mut Download, message: &str) -> Result<()> {
        let code = DownloadErrorCode::normalize(Some(message));
        self.fail_with_code(download, code, message).await
    }

    async fn fail_with_code(
        &self,
        download: &mut Download,
        code: DownloadErrorCode,
        message: &str,
    ) -> Result<()> {
        download.record_failure(code, message)?;
        self.downloads.update(download).await?;
        self.settle_work_item_failed(download, message).await?;

        self.stats.lock().await.failed_total += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_download("failed");
        }
        info!(
            download = %download.id,
            error_code = %code,
            retry_count = download.retry_count,
            next_retry_at = ?download.next_retry_at,
            "Download failed"
        );
        Ok(())
    }

    async fn kill_stale_transfer(
        &self,
        download: &mut Download,
        transfer: &ExternalDownload,
    ) -> Result<()> {
        warn!(
            download = %download.id,
            external_id = %transfer.external_id,
            threshold_secs = self.settings.stale_threshold.as_secs(),
            "Transfer made no progress, cancelling"
        );

        if let Err(e) = self.client.cancel(&transfer.external_id).await {
            warn!(external_id = %transfer.external_id, error = %e, "Cancel of stale transfer failed");
        }
        self.progress.lock().await.remove(&transfer.external_id);

        self.fail_with_code(
            download,
            DownloadErrorCode::Timeout,
            "transfer stalled with no byte progress",
        )
        .await?;
        self.stats.lock().await.stale_cancelled_total += 1;
        Ok(())
    }

    async fn settle_work_item_failed(&self, download: &Download, message: &str) -> Result<()> {
        if let Some(item) = self.work_items.find_active_dispatch(download.id).await? {
            self.work_items.settle_failed(item.id, message).await?;
        }
        Ok(())
    }

    fn publish_breaker_metric(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_state(self.breaker.name(), self.breaker.state());
        }
    }
}

#[async_trait]
impl BackgroundWorker for DownloadStatusWorker {
    fn name(&self) -> &'static str {
        "download_status"
    }

    async fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats().await).unwrap_or(serde_json::Value::Null)
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.settings.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Download status cycle failed");
                    }
                }
            }
        }
    }
}
