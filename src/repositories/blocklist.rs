//! Persistence for blocklist entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::blocklist::BlocklistEntry;

#[async_trait]
pub trait BlocklistStore: Send + Sync {
    /// Insert or refresh the entry for `(username, filepath)`. Re-blocking an
    /// existing source bumps its failure count and pushes the expiry out.
    async fn upsert(&self, entry: &BlocklistEntry) -> Result<()>;

    async fn find_for_source(
        &self,
        username: Option<&str>,
        filepath: Option<&str>,
    ) -> Result<Option<BlocklistEntry>>;

    /// Whether an active entry blocks this exact source, via any scope
    async fn is_blocked(&self, username: &str, filepath: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Drop entries whose `expires_at` has passed. Returns how many.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlocklistEntry>>;
}

#[derive(sqlx::FromRow)]
struct BlocklistRow {
    id: Uuid,
    username: Option<String>,
    filepath: Option<String>,
    scope: String,
    reason: Option<String>,
    failure_count: i32,
    blocked_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    is_manual: bool,
}

impl TryFrom<BlocklistRow> for BlocklistEntry {
    type Error = AppError;

    fn try_from(row: BlocklistRow) -> Result<BlocklistEntry> {
        Ok(BlocklistEntry {
            id: row.id,
            username: row.username,
            filepath: row.filepath,
            scope: row.scope.parse().map_err(AppError::Internal)?,
            reason: row
                .reason
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(AppError::Internal)?,
            failure_count: row.failure_count,
            blocked_at: row.blocked_at,
            expires_at: row.expires_at,
            is_manual: row.is_manual,
        })
    }
}

const SELECT_COLUMNS: &str =
    "id, username, filepath, scope, reason, failure_count, blocked_at, expires_at, is_manual";

pub struct PgBlocklistStore {
    pool: PgPool,
}

impl PgBlocklistStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlocklistStore for PgBlocklistStore {
    async fn upsert(&self, entry: &BlocklistEntry) -> Result<()> {
        // The unique constraint does not deduplicate NULL columns, so the
        // upsert matches with IS NOT DISTINCT FROM instead of ON CONFLICT.
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM blocklist \
             WHERE username IS NOT DISTINCT FROM $1 AND filepath IS NOT DISTINCT FROM $2 \
             FOR UPDATE",
        )
        .bind(&entry.username)
        .bind(&entry.filepath)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id,)) = existing {
            sqlx::query(
                "UPDATE blocklist \
                 SET scope = $2, reason = $3, failure_count = $4, blocked_at = $5, \
                     expires_at = $6 \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(entry.scope.as_str())
            .bind(entry.reason.map(|r| r.as_str()))
            .bind(entry.failure_count)
            .bind(entry.blocked_at)
            .bind(entry.expires_at)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO blocklist \
                 (id, username, filepath, scope, reason, failure_count, blocked_at, expires_at, is_manual) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(entry.id)
            .bind(&entry.username)
            .bind(&entry.filepath)
            .bind(entry.scope.as_str())
            .bind(entry.reason.map(|r| r.as_str()))
            .bind(entry.failure_count)
            .bind(entry.blocked_at)
            .bind(entry.expires_at)
            .bind(entry.is_manual)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_for_source(
        &self,
        username: Option<&str>,
        filepath: Option<&str>,
    ) -> Result<Option<BlocklistEntry>> {
        let row: Option<BlocklistRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM blocklist \
             WHERE username IS NOT DISTINCT FROM $1 AND filepath IS NOT DISTINCT FROM $2"
        ))
        .bind(username)
        .bind(filepath)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn is_blocked(
        &self,
        username: &str,
        filepath: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS( \
                 SELECT 1 FROM blocklist \
                 WHERE (expires_at IS NULL OR expires_at > $3) \
                   AND ((scope = 'username' AND username = $1) \
                     OR (scope = 'filepath' AND filepath = $2) \
                     OR (scope = 'specific' AND username = $1 AND filepath = $2)))",
        )
        .bind(username)
        .bind(filepath)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted =
            sqlx::query("DELETE FROM blocklist WHERE expires_at IS NOT NULL AND expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(deleted.rows_affected())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlocklistEntry>> {
        let rows: Vec<BlocklistRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM blocklist \
             WHERE expires_at IS NULL OR expires_at > $1 \
             ORDER BY blocked_at DESC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
