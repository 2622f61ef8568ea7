//! Persistence for service tokens and the app-settings key/value table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{AppError, Result};
use crate::models::token::{ServiceKind, ServiceToken};

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, service: ServiceKind) -> Result<Option<ServiceToken>>;

    /// Replace the single row for this service (at most one active token)
    async fn upsert(&self, token: &ServiceToken) -> Result<()>;

    async fn delete(&self, service: ServiceKind) -> Result<()>;

    async fn all(&self) -> Result<Vec<ServiceToken>>;
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    service: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    scope: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TokenRow> for ServiceToken {
    type Error = AppError;

    fn try_from(row: TokenRow) -> Result<ServiceToken> {
        Ok(ServiceToken {
            service: row.service.parse().map_err(AppError::Internal)?,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            expires_at: row.expires_at,
            scope: row.scope,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn get(&self, service: ServiceKind) -> Result<Option<ServiceToken>> {
        let row: Option<TokenRow> = sqlx::query_as(
            "SELECT service, access_token, refresh_token, expires_at, scope, updated_at \
             FROM service_tokens WHERE service = $1",
        )
        .bind(service.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn upsert(&self, token: &ServiceToken) -> Result<()> {
        if token.access_token.is_empty() {
            return Err(AppError::Validation(
                "access_token must be non-empty".to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO service_tokens (service, access_token, refresh_token, expires_at, scope, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (service) DO UPDATE SET \
                 access_token = EXCLUDED.access_token, \
                 refresh_token = EXCLUDED.refresh_token, \
                 expires_at = EXCLUDED.expires_at, \
                 scope = EXCLUDED.scope, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(token.service.as_str())
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at)
        .bind(&token.scope)
        .bind(token.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, service: ServiceKind) -> Result<()> {
        sqlx::query("DELETE FROM service_tokens WHERE service = $1")
            .bind(service.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<ServiceToken>> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            "SELECT service, access_token, refresh_token, expires_at, scope, updated_at \
             FROM service_tokens",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

/// Small key/value settings store; the coordinator persists per-task
/// `last_run_at` here so cooldowns survive restarts.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (key, value, updated_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
