//! Persistence for `Download` rows.
//!
//! The two download workers touch disjoint slices of this table: the queue
//! worker acts on `waiting`/`failed`, the status worker on
//! `pending`/`queued`/`downloading`. Every mutation goes through the entity
//! state machine first; the store persists already-validated values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::download::{Download, DownloadStatus};
use crate::models::error_codes::DownloadErrorCode;
use crate::models::work_item::{NewWorkItem, WorkItem};

/// A download source that has accumulated failures inside the window
#[derive(Debug, Clone)]
pub struct FailureGroup {
    pub username: String,
    pub filename: String,
    pub failures: i64,
    pub last_reason: Option<DownloadErrorCode>,
}

/// Per-status row count for the status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadCount {
    pub status: String,
    pub count: i64,
}

#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn insert(&self, download: &Download) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Download>>;

    /// Persist the mutable fields of an already-transitioned entity
    async fn update(&self, download: &Download) -> Result<()>;

    /// `waiting` downloads, highest priority first, oldest first within a priority
    async fn list_waiting(&self, limit: i64) -> Result<Vec<Download>>;

    /// Enqueue the dispatch work item and flip the download to `pending` in a
    /// single transaction, so a crash can never leave one without the other.
    async fn promote_to_pending(&self, download_id: Uuid, dispatch: NewWorkItem)
        -> Result<WorkItem>;

    /// Failed downloads whose retry is due: retryable error code,
    /// `retry_count <= max_retries`, `next_retry_at <= now`
    async fn list_retry_eligible(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Download>>;

    /// Locate the download matching an external client entry, by external id
    /// first and `(username, filename)` fingerprint as fallback
    async fn find_by_external(
        &self,
        external_id: &str,
        username: Option<&str>,
        filename: &str,
    ) -> Result<Option<Download>>;

    /// Whether a non-terminal download already exists for this track
    async fn has_active_for_track(&self, track_id: Uuid) -> Result<bool>;

    /// Sources with at least `threshold` failures since `window_start`
    async fn failure_groups(
        &self,
        window_start: DateTime<Utc>,
        threshold: i64,
    ) -> Result<Vec<FailureGroup>>;

    /// Transition `failed` downloads pinned to the given source to
    /// `blocklisted`. A `None` username or filename widens the match to the
    /// corresponding blocklist scope. Returns the affected ids.
    async fn blocklist_failed_source(
        &self,
        username: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Vec<Uuid>>;

    /// Cancel `failed` downloads untouched since `cutoff` and reset their
    /// tracks to `not_needed`. Returns how many were reset.
    async fn reset_old_failed(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn counts_by_status(&self) -> Result<Vec<DownloadCount>>;
}

#[derive(sqlx::FromRow)]
struct DownloadRow {
    id: Uuid,
    track_id: Uuid,
    status: String,
    priority: i32,
    progress_percent: f64,
    username: Option<String>,
    filename: Option<String>,
    external_id: Option<String>,
    error_message: Option<String>,
    last_error_code: Option<String>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DownloadRow> for Download {
    type Error = AppError;

    fn try_from(row: DownloadRow) -> Result<Download> {
        Ok(Download {
            id: row.id,
            track_id: row.track_id,
            status: row.status.parse().map_err(AppError::Internal)?,
            priority: row.priority,
            progress_percent: row.progress_percent,
            username: row.username,
            filename: row.filename,
            external_id: row.external_id,
            error_message: row.error_message,
            last_error_code: row
                .last_error_code
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(AppError::Internal)?,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Columns returned when the promotion transaction inserts the dispatch item
#[derive(sqlx::FromRow)]
struct InsertedJobRow {
    id: Uuid,
    created_at: DateTime<Utc>,
}

const SELECT_COLUMNS: &str = "id, track_id, status, priority, progress_percent, username, \
     filename, external_id, error_message, last_error_code, retry_count, max_retries, \
     next_retry_at, created_at, started_at, completed_at";

const RETRYABLE_CODES: &str =
    "'timeout', 'user_offline', 'transfer_failed', 'queue_timeout', 'connection_error', \
     'rate_limited', 'service_unavailable', 'unknown'";

pub struct PgDownloadStore {
    pool: PgPool,
}

impl PgDownloadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DownloadStore for PgDownloadStore {
    async fn insert(&self, download: &Download) -> Result<()> {
        sqlx::query(
            "INSERT INTO downloads \
             (id, track_id, status, priority, progress_percent, username, filename, external_id, \
              error_message, last_error_code, retry_count, max_retries, next_retry_at, \
              created_at, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(download.id)
        .bind(download.track_id)
        .bind(download.status.as_str())
        .bind(download.priority)
        .bind(download.progress_percent)
        .bind(&download.username)
        .bind(&download.filename)
        .bind(&download.external_id)
        .bind(&download.error_message)
        .bind(download.last_error_code.map(|c| c.as_str()))
        .bind(download.retry_count)
        .bind(download.max_retries)
        .bind(download.next_retry_at)
        .bind(download.created_at)
        .bind(download.started_at)
        .bind(download.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Download>> {
        let row: Option<DownloadRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM downloads WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, download: &Download) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE downloads SET \
             status = $2, priority = $3, progress_percent = $4, username = $5, filename = $6, \
             external_id = $7, error_message = $8, last_error_code = $9, retry_count = $10, \
             next_retry_at = $11, started_at = $12, completed_at = $13 \
             WHERE id = $1",
        )
        .bind(download.id)
        .bind(download.status.as_str())
        .bind(download.priority)
        .bind(download.progress_percent)
        .bind(&download.username)
        .bind(&download.filename)
        .bind(&download.external_id)
        .bind(&download.error_message)
        .bind(download.last_error_code.map(|c| c.as_str()))
        .bind(download.retry_count)
        .bind(download.next_retry_at)
        .bind(download.started_at)
        .bind(download.completed_at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource: format!("download {}", download.id),
            });
        }
        Ok(())
    }

    async fn list_waiting(&self, limit: i64) -> Result<Vec<Download>> {
        let rows: Vec<DownloadRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM downloads \
             WHERE status = 'waiting' \
             ORDER BY priority DESC, created_at ASC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn promote_to_pending(
        &self,
        download_id: Uuid,
        dispatch: NewWorkItem,
    ) -> Result<WorkItem> {
        let mut tx = self.pool.begin().await?;

        let promoted = sqlx::query(
            "UPDATE downloads SET status = 'pending' WHERE id = $1 AND status = 'waiting'",
        )
        .bind(download_id)
        .execute(&mut *tx)
        .await?;

        if promoted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::InvalidTransition {
                from: "not waiting".to_string(),
                to: DownloadStatus::Pending.to_string(),
            });
        }

        let row: InsertedJobRow = sqlx::query_as(
            "INSERT INTO background_jobs \
             (id, job_type, status, priority, payload, retries, max_retries, created_at, next_run_at) \
             VALUES ($1, $2, 'pending', $3, $4, 0, $5, NOW(), $6) \
             RETURNING id, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(dispatch.job_type.as_str())
        .bind(dispatch.priority)
        .bind(&dispatch.payload)
        .bind(dispatch.max_retries)
        .bind(dispatch.run_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(WorkItem {
            id: row.id,
            job_type: dispatch.job_type,
            status: crate::models::WorkItemStatus::Pending,
            priority: dispatch.priority,
            payload: dispatch.payload,
            result: None,
            error: None,
            retries: 0,
            max_retries: dispatch.max_retries,
            created_at: row.created_at,
            started_at: None,
            completed_at: None,
            locked_by: None,
            locked_at: None,
            next_run_at: dispatch.run_at,
        })
    }

    async fn list_retry_eligible(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Download>> {
        let rows: Vec<DownloadRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM downloads \
             WHERE status = 'failed' \
               AND retry_count <= max_retries \
               AND next_retry_at IS NOT NULL AND next_retry_at <= $1 \
               AND (last_error_code IS NULL OR last_error_code IN ({RETRYABLE_CODES})) \
             ORDER BY priority DESC, next_retry_at ASC \
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_by_external(
        &self,
        external_id: &str,
        username: Option<&str>,
        filename: &str,
    ) -> Result<Option<Download>> {
        let row: Option<DownloadRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM downloads \
             WHERE external_id = $1 \
                OR (external_id IS NULL AND username IS NOT DISTINCT FROM $2 AND filename = $3) \
             ORDER BY created_at DESC \
             LIMIT 1"
        ))
        .bind(external_id)
        .bind(username)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn has_active_for_track(&self, track_id: Uuid) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS( \
                 SELECT 1 FROM downloads \
                 WHERE track_id = $1 \
                   AND status NOT IN ('completed', 'cancelled', 'blocklisted'))",
        )
        .bind(track_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn failure_groups(
        &self,
        window_start: DateTime<Utc>,
        threshold: i64,
    ) -> Result<Vec<FailureGroup>> {
        let rows: Vec<(String, String, i64, Option<String>)> = sqlx::query_as(
            "SELECT username, filename, COUNT(*), \
                    (ARRAY_AGG(last_error_code ORDER BY COALESCE(started_at, created_at) DESC))[1] \
             FROM downloads \
             WHERE status = 'failed' \
               AND username IS NOT NULL AND filename IS NOT NULL \
               AND COALESCE(started_at, created_at) >= $1 \
             GROUP BY username, filename \
             HAVING COUNT(*) >= $2",
        )
        .bind(window_start)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(username, filename, failures, reason)| {
                Ok(FailureGroup {
                    username,
                    filename,
                    failures,
                    last_reason: reason
                        .as_deref()
                        .map(str::parse)
                        .transpose()
                        .map_err(AppError::Internal)?,
                })
            })
            .collect()
    }

    async fn blocklist_failed_source(
        &self,
        username: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE downloads \
             SET status = 'blocklisted', completed_at = NOW() \
             WHERE status = 'failed' \
               AND ($1::text IS NULL OR username = $1) \
               AND ($2::text IS NULL OR filename = $2) \
             RETURNING id",
        )
        .bind(username)
        .bind(filename)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn reset_old_failed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "UPDATE downloads \
             SET status = 'cancelled', completed_at = NOW() \
             WHERE status = 'failed' AND COALESCE(started_at, created_at) < $1 \
             RETURNING id, track_id",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        if !rows.is_empty() {
            let track_ids: Vec<Uuid> = rows.iter().map(|(_, track_id)| *track_id).collect();
            sqlx::query(
                "UPDATE tracks SET download_state = 'not_needed', updated_at = NOW() \
                 WHERE id = ANY($1) AND download_state = 'failed'",
            )
            .bind(&track_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn counts_by_status(&self) -> Result<Vec<DownloadCount>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM downloads GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(status, count)| DownloadCount { status, count })
            .collect())
    }
}
