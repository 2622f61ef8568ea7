//! Download queue worker: the single manager of the download queue.
//!
//! One cycle does three things, in order:
//! 1. Promote `waiting` downloads to `pending`, enqueueing a dispatch work
//!    item for each (same transaction as the status change).
//! 2. Reactivate `failed` downloads whose retry is due (`failed → waiting`).
//! 3. Escalate sources that keep failing to the blocklist and move their
//!    downloads to `blocklisted`.
//!
//! The cycle is skipped entirely while the external client is unreachable,
//! so nothing piles up inside a dead daemon.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::download_client::ExternalDownloadClient;
use super::orchestrator::BackgroundWorker;
use super::work_queue::{HandlerOutcome, WorkItemHandler};
use crate::config::QueueSettings;
use crate::error::{AppError, Result};
use crate::metrics::MetricsCollector;
use crate::models::blocklist::BlocklistEntry;
use crate::models::download::DownloadStatus;
use crate::models::error_codes::DownloadErrorCode;
use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemType};
use crate::repositories::blocklist::BlocklistStore;
use crate::repositories::downloads::DownloadStore;

/// Payload of a `download.dispatch` work item
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub download_id: Uuid,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueWorkerStats {
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub promoted_total: u64,
    pub retries_activated_total: u64,
    pub blocklisted_total: u64,
    pub cycles_skipped_unavailable: u64,
}

pub struct DownloadQueueWorker {
    client: Arc<dyn ExternalDownloadClient>,
    downloads: Arc<dyn DownloadStore>,
    blocklist: Arc<dyn BlocklistStore>,
    metrics: Option<Arc<MetricsCollector>>,
    settings: QueueSettings,
    stats: Mutex<QueueWorkerStats>,
}

impl DownloadQueueWorker {
    pub fn new(
        client: Arc<dyn ExternalDownloadClient>,
        downloads: Arc<dyn DownloadStore>,
        blocklist: Arc<dyn BlocklistStore>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            client,
            downloads,
            blocklist,
            metrics: None,
            settings,
            stats: Mutex::new(QueueWorkerStats::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn stats(&self) -> QueueWorkerStats {
        self.stats.lock().await.clone()
    }

    pub async fn run_cycle(&self) -> Result<()> {
        if !self.client.is_available().await {
            debug!(client = self.client.name(), "Download client unavailable, skipping cycle");
            let mut stats = self.stats.lock().await;
            stats.cycles_skipped_unavailable += 1;
            stats.last_cycle_at = Some(Utc::now());
            return Ok(());
        }

        let promoted = self.promote_waiting().await?;
        let reactivated = self.reactivate_retries().await?;
        let blocklisted = self.escalate_to_blocklist().await?;

        let mut stats = self.stats.lock().await;
        stats.last_cycle_at = Some(Utc::now());
        stats.promoted_total += promoted;
        stats.retries_activated_total += reactivated;
        stats.blocklisted_total += blocklisted;
        Ok(())
    }

    /// Step 1: `waiting → pending`, one dispatch work item per download
    async fn promote_waiting(&self) -> Result<u64> {
        let waiting = self
            .downloads
            .list_waiting(self.settings.max_per_cycle as i64)
            .await?;

        let mut promoted = 0;
        for download in waiting {
            let payload = serde_json::to_value(DispatchPayload {
                download_id: download.id,
            })
            .map_err(|e| AppError::Internal(format!("dispatch payload: {e}")))?;

            let item = NewWorkItem::new(WorkItemType::DownloadDispatch, payload)
                .with_priority(download.priority);

            match self.downloads.promote_to_pending(download.id, item).await {
                Ok(work_item) => {
                    info!(
                        download = %download.id,
                        work_item = %work_item.id,
                        priority = download.priority,
                        "Promoted download for dispatch"
                    );
                    promoted += 1;
                }
                Err(AppError::InvalidTransition { .. }) => {
                    // Lost a race with another transition; nothing to undo
                    debug!(download = %download.id, "Download no longer waiting, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }

    /// Step 2: `failed → waiting` for downloads whose backoff has elapsed
    async fn reactivate_retries(&self) -> Result<u64> {
        let now = Utc::now();
        let eligible = self
            .downloads
            .list_retry_eligible(self.settings.max_per_cycle as i64, now)
            .await?;

        let mut reactivated = 0;
        for mut download in eligible {
            if let Err(e) = download.activate_for_retry() {
                debug!(download = %download.id, error = %e, "Retry activation rejected");
                continue;
            }
            self.downloads.update(&download).await?;
            info!(
                download = %download.id,
                attempt = download.retry_count,
                max_retries = download.max_retries,
                "Activated download for retry"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_download("retried");
            }
            reactivated += 1;
        }
        Ok(reactivated)
    }

    /// Step 3: sources with repeated failures inside the window get blocked
    /// and their failed downloads become `blocklisted`.
    async fn escalate_to_blocklist(&self) -> Result<u64> {
        let window_start = Utc::now()
            - chrono::Duration::from_std(self.settings.blocklist_failure_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        let groups = self
            .downloads
            .failure_groups(window_start, self.settings.blocklist_failure_threshold as i64)
            .await?;

        let ttl = chrono::Duration::from_std(self.settings.blocklist_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(7));

        let mut blocklisted = 0;
        for group in groups {
            let reason = group.last_reason.unwrap_or(DownloadErrorCode::Unknown);
            let entry = BlocklistEntry::automatic(
                Some(group.username.clone()),
                Some(group.filename.clone()),
                reason,
                group.failures as i32,
                ttl,
            );

            // The scope decides how wide the net is cast over failed rows
            let (username, filename) = match entry.scope {
                crate::models::blocklist::BlocklistScope::Username => {
                    (Some(group.username.as_str()), None)
                }
                crate::models::blocklist::BlocklistScope::Filepath => {
                    (None, Some(group.filename.as_str()))
                }
                crate::models::blocklist::BlocklistScope::Specific => {
                    (Some(group.username.as_str()), Some(group.filename.as_str()))
                }
            };

            self.blocklist.upsert(&entry).await?;
            let affected = self
                .downloads
                .blocklist_failed_source(username, filename)
                .await?;

            warn!(
                username = %group.username,
                filename = %group.filename,
                scope = %entry.scope,
                reason = %reason,
                failures = group.failures,
                downloads_blocklisted = affected.len(),
                "Escalated failing source to blocklist"
            );
            if let Some(metrics) = &self.metrics {
                for _ in &affected {
                    metrics.record_download("blocklisted");
                }
            }
            blocklisted += affected.len() as u64;
        }
        Ok(blocklisted)
    }
}

#[async_trait]
impl BackgroundWorker for DownloadQueueWorker {
    fn name(&self) -> &'static str {
        "download_queue"
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
                        warn!(error = %e, "Download queue cycle failed");
                    }
                }
            }
        }
    }
}

/// Handler for `download.dispatch` items: submits the download to the
/// external client. Idempotent: a re-dispatched item for a download that is
/// already with the client just keeps tracking it.
pub struct DownloadDispatchHandler {
    client: Arc<dyn ExternalDownloadClient>,
    downloads: Arc<dyn DownloadStore>,
}

impl DownloadDispatchHandler {
    pub fn new(client: Arc<dyn ExternalDownloadClient>, downloads: Arc<dyn DownloadStore>) -> Self {
        Self { client, downloads }
    }
}

#[async_trait]
impl WorkItemHandler for DownloadDispatchHandler {
    async fn handle(&self, item: &WorkItem) -> Result<HandlerOutcome> {
        let payload: DispatchPayload = serde_json::from_value(item.payload.clone())
            .map_err(|e| AppError::Validation(format!("bad dispatch payload: {e}")))?;

        let mut download = self
            .downloads
            .get(payload.download_id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("download {}", payload.download_id),
            })?;

        match download.status {
            DownloadStatus::Pending => {
                if download.external_id.is_some() {
                    // Already submitted by an earlier attempt of this item
                    return Ok(HandlerOutcome::Deferred);
                }

                let (Some(username), Some(filename)) =
                    (download.username.clone(), download.filename.clone())
                else {
                    return Err(AppError::Validation(format!(
                        "download {} has no source to dispatch to",
                        download.id
                    )));
                };

                let external_id = self.client.enqueue(&username, &filename).await?;
                download.external_id = Some(external_id.clone());
                self.downloads.update(&download).await?;

                info!(
                    download = %download.id,
                    external_id = %external_id,
                    username = %username,
                    "Submitted download to external client"
                );
                // The status worker settles this item once the transfer ends
                Ok(HandlerOutcome::Deferred)
            }
            // Already with the client; keep the item open for reconciliation
            DownloadStatus::Queued | DownloadStatus::Downloading => Ok(HandlerOutcome::Deferred),
            // Nothing left to dispatch; close the item without complaint
            status => Ok(HandlerOutcome::Completed(
                serde_json::json!({ "skipped": status.as_str() }),
            )),
        }
    }
}
