//! Persistence for the work-item queue (`background_jobs`).
//!
//! `acquire_next` is the concurrency-critical operation: it selects the next
//! eligible row with `FOR UPDATE SKIP LOCKED` inside a transaction, so two
//! workers polling at the same instant can never receive the same item.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::work_item::{
    retry_backoff, NewWorkItem, WorkItem, WorkItemStatus, WorkItemType,
};

/// Query filter for the observability listing
#[derive(Debug, Clone, Default)]
pub struct WorkItemFilter {
    pub status: Option<WorkItemStatus>,
    pub job_type: Option<WorkItemType>,
    pub limit: Option<i64>,
}

/// Per-(type, status) row count for queue introspection
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueDepth {
    pub job_type: String,
    pub status: String,
    pub count: i64,
}

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    async fn insert(&self, item: NewWorkItem) -> Result<WorkItem>;

    /// Atomically claim the highest-priority eligible pending item matching
    /// `types`, moving it to `running` with the caller's lease. Equal
    /// priorities are served oldest-first.
    async fn acquire_next(&self, worker_id: &str, types: &[WorkItemType])
        -> Result<Option<WorkItem>>;

    /// `running → completed`; fails unless the caller holds the lease
    async fn complete(&self, id: Uuid, worker_id: &str, result: serde_json::Value) -> Result<()>;

    /// Record a handler failure. Below the retry cap the item returns to
    /// `pending` with `next_run_at` pushed out by the shared backoff;
    /// otherwise it lands in `failed`. Returns the resulting status.
    async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> Result<WorkItemStatus>;

    /// Terminal manual transition; idempotent on already-cancelled items
    async fn cancel(&self, id: Uuid) -> Result<()>;

    /// Return `running` items whose lease is older than `threshold` to
    /// `pending` and clear their lease. Returns the reclaimed ids.
    async fn release_stale(&self, threshold: Duration) -> Result<Vec<Uuid>>;

    /// Settle an item from outside its lease (used by the status worker when
    /// the external client reports the real-world outcome). Accepts items in
    /// `running` or `pending`; returns false when no such item exists.
    async fn settle_completed(&self, id: Uuid, result: serde_json::Value) -> Result<bool>;
    async fn settle_failed(&self, id: Uuid, error: &str) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>>;
    async fn list(&self, filter: WorkItemFilter) -> Result<Vec<WorkItem>>;

    /// The active dispatch item (pending or running) for a download, if any
    async fn find_active_dispatch(&self, download_id: Uuid) -> Result<Option<WorkItem>>;

    /// Whether any pending/running item of this type exists
    async fn has_active(&self, job_type: WorkItemType) -> Result<bool>;

    async fn queue_depths(&self) -> Result<Vec<QueueDepth>>;
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    job_type: String,
    status: String,
    priority: i32,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    retries: i32,
    max_retries: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = AppError;

    fn try_from(row: WorkItemRow) -> Result<WorkItem> {
        Ok(WorkItem {
            id: row.id,
            job_type: row
                .job_type
                .parse()
                .map_err(|e: String| AppError::Internal(e))?,
            status: row
                .status
                .parse()
                .map_err(|e: String| AppError::Internal(e))?,
            priority: row.priority,
            payload: row.payload,
            result: row.result,
            error: row.error,
            retries: row.retries,
            max_retries: row.max_retries,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            next_run_at: row.next_run_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, job_type, status, priority, payload, result, error, retries, \
     max_retries, created_at, started_at, completed_at, locked_by, locked_at, next_run_at";

pub struct PgWorkItemStore {
    pool: PgPool,
}

impl PgWorkItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkItemStore for PgWorkItemStore {
    async fn insert(&self, item: NewWorkItem) -> Result<WorkItem> {
        let row: WorkItemRow = sqlx::query_as(&format!(
            "INSERT INTO background_jobs \
             (id, job_type, status, priority, payload, retries, max_retries, created_at, next_run_at) \
             VALUES ($1, $2, 'pending', $3, $4, 0, $5, NOW(), $6) \
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(item.job_type.as_str())
        .bind(item.priority)
        .bind(&item.payload)
        .bind(item.max_retries)
        .bind(item.run_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn acquire_next(
        &self,
        worker_id: &str,
        types: &[WorkItemType],
    ) -> Result<Option<WorkItem>> {
        if types.is_empty() {
            return Ok(None);
        }
        let type_names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();

        let mut tx = self.pool.begin().await?;

        let candidate: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM background_jobs \
             WHERE status = 'pending' \
               AND (next_run_at IS NULL OR next_run_at <= NOW()) \
               AND job_type = ANY($1) \
             ORDER BY priority DESC, created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(&type_names)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        let row: WorkItemRow = sqlx::query_as(&format!(
            "UPDATE background_jobs \
             SET status = 'running', locked_by = $2, locked_at = NOW(), \
                 started_at = COALESCE(started_at, NOW()) \
             WHERE id = $1 \
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(id)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row.try_into()?))
    }

    async fn complete(&self, id: Uuid, worker_id: &str, result: serde_json::Value) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE background_jobs \
             SET status = 'completed', result = $3, completed_at = NOW(), \
                 locked_by = NULL, locked_at = NULL \
             WHERE id = $1 AND status = 'running' AND locked_by = $2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(&result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::InvalidTransition {
                from: "not running or not leased by caller".to_string(),
                to: "completed".to_string(),
            });
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> Result<WorkItemStatus> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i32, i32)> = sqlx::query_as(
            "SELECT retries, max_retries FROM background_jobs \
             WHERE id = $1 AND status = 'running' AND locked_by = $2 \
             FOR UPDATE",
        )
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((retries, max_retries)) = row else {
            tx.rollback().await?;
            return Err(AppError::InvalidTransition {
                from: "not running or not leased by caller".to_string(),
                to: "failed".to_string(),
            });
        };

        let status = if retries < max_retries {
            let next_retries = retries + 1;
            let next_run_at = Utc::now() + retry_backoff(next_retries);
            sqlx::query(
                "UPDATE background_jobs \
                 SET status = 'pending', retries = $2, error = $3, next_run_at = $4, \
                     locked_by = NULL, locked_at = NULL \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(next_retries)
            .bind(error)
            .bind(next_run_at)
            .execute(&mut *tx)
            .await?;
            WorkItemStatus::Pending
        } else {
            sqlx::query(
                "UPDATE background_jobs \
                 SET status = 'failed', error = $2, completed_at = NOW(), \
                     locked_by = NULL, locked_at = NULL \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            WorkItemStatus::Failed
        };

        tx.commit().await?;
        Ok(status)
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM background_jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = row else {
            tx.rollback().await?;
            return Err(AppError::NotFound {
                resource: format!("work item {id}"),
            });
        };
        let status: WorkItemStatus = status.parse().map_err(AppError::Internal)?;

        match status {
            WorkItemStatus::Cancelled => {
                tx.rollback().await?;
                Ok(())
            }
            s if s.is_terminal() => {
                tx.rollback().await?;
                Err(AppError::InvalidTransition {
                    from: s.to_string(),
                    to: WorkItemStatus::Cancelled.to_string(),
                })
            }
            _ => {
                sqlx::query(
                    "UPDATE background_jobs \
                     SET status = 'cancelled', completed_at = NOW(), \
                         locked_by = NULL, locked_at = NULL \
                     WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(())
            }
        }
    }

    async fn release_stale(&self, threshold: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - threshold;
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE background_jobs \
             SET status = 'pending', locked_by = NULL, locked_at = NULL \
             WHERE status = 'running' AND locked_at < $1 \
             RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn settle_completed(&self, id: Uuid, result: serde_json::Value) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE background_jobs \
             SET status = 'completed', result = $2, completed_at = NOW(), \
                 locked_by = NULL, locked_at = NULL \
             WHERE id = $1 AND status IN ('running', 'pending')",
        )
        .bind(id)
        .bind(&result)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn settle_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE background_jobs \
             SET status = 'failed', error = $2, completed_at = NOW(), \
                 locked_by = NULL, locked_at = NULL \
             WHERE id = $1 AND status IN ('running', 'pending')",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM background_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, filter: WorkItemFilter) -> Result<Vec<WorkItem>> {
        let limit = filter.limit.unwrap_or(100);
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM background_jobs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR job_type = $2) \
             ORDER BY created_at DESC \
             LIMIT $3"
        ))
        .bind(filter.status.map(|s| s.as_str().to_string()))
        .bind(filter.job_type.map(|t| t.as_str().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_active_dispatch(&self, download_id: Uuid) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM background_jobs \
             WHERE job_type = 'download.dispatch' \
               AND status IN ('pending', 'running') \
               AND payload->>'download_id' = $1 \
             ORDER BY created_at ASC \
             LIMIT 1"
        ))
        .bind(download_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn has_active(&self, job_type: WorkItemType) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS( \
                 SELECT 1 FROM background_jobs \
                 WHERE job_type = $1 AND status IN ('pending', 'running'))",
        )
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn queue_depths(&self) -> Result<Vec<QueueDepth>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT job_type, status, COUNT(*) FROM background_jobs GROUP BY job_type, status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(job_type, status, count)| QueueDepth {
                job_type,
                status,
                count,
            })
            .collect())
    }
}
