//! Server-side OAuth token manager.
//!
//! One shared token per external service, used by every device and worker.
//! Reads return a fresh access token, refreshing synchronously when needed;
//! refresh is single-flight per service so a burst of readers observing an
//! expired token produces exactly one network call. A `needs_reauth` signal
//! parks the service until a new user authorization stores a fresh token;
//! background workers skip it quietly instead of crash-looping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use super::orchestrator::BackgroundWorker;
use super::session_store::SessionStore;
use crate::config::TokenSettings;
use crate::error::{AppError, Result};
use crate::models::token::{ServiceKind, ServiceToken, TokenResponse};
use crate::repositories::tokens::TokenStore;
use crate::services::oauth_endpoint::AuthorizationEndpoint;

pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    endpoints: HashMap<ServiceKind, Arc<dyn AuthorizationEndpoint>>,
    leeway: Duration,
    cache: RwLock<HashMap<ServiceKind, ServiceToken>>,
    /// One refresh in flight per service; waiters reuse its result
    refresh_locks: HashMap<ServiceKind, Mutex<()>>,
    /// Services whose refresh token is dead until the user re-authorizes
    reauth_required: RwLock<HashSet<ServiceKind>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        endpoints: HashMap<ServiceKind, Arc<dyn AuthorizationEndpoint>>,
        settings: &TokenSettings,
    ) -> Self {
        let refresh_locks = ServiceKind::ALL
            .iter()
            .map(|service| (*service, Mutex::new(())))
            .collect();

        Self {
            store,
            endpoints,
            leeway: Duration::from_std(settings.refresh_leeway)
                .unwrap_or_else(|_| Duration::seconds(60)),
            cache: RwLock::new(HashMap::new()),
            refresh_locks,
            reauth_required: RwLock::new(HashSet::new()),
        }
    }

    /// A non-expired access token for `service`, refreshing if necessary.
    pub async fn get_access_token(&self, service: ServiceKind) -> Result<String> {
        if self.reauth_required.read().await.contains(&service) {
            return Err(AppError::NeedsReauthentication {
                service: service.to_string(),
            });
        }

        let now = Utc::now();
        if let Some(token) = self.current(service).await? {
            if token.is_fresh(now, self.leeway) {
                return Ok(token.access_token);
            }
        }

        let lock = self
            .refresh_locks
            .get(&service)
            .expect("lock exists for every service");
        let _guard = lock.lock().await;

        // Someone else may have finished the refresh while we waited
        if let Some(token) = self.current(service).await? {
            if token.is_fresh(Utc::now(), self.leeway) {
                return Ok(token.access_token);
            }
            return self.refresh_locked(service, token).await;
        }

        // No token at all: only a fresh user authorization can fix this
        Err(AppError::NeedsReauthentication {
            service: service.to_string(),
        })
    }

    /// Store token material obtained from an authorization code exchange.
    /// Clears any pending re-auth flag for the service.
    pub async fn store_token(&self, service: ServiceKind, response: TokenResponse) -> Result<()> {
        let previous_refresh = self
            .current(service)
            .await
            .ok()
            .flatten()
            .and_then(|t| t.refresh_token);
        let token = response.into_token(service, previous_refresh);

        self.persist_with_retry(&token).await?;
        self.cache.write().await.insert(service, token);
        self.reauth_required.write().await.remove(&service);
        info!(service = %service, "Stored new service token");
        Ok(())
    }

    pub async fn needs_reauth(&self, service: ServiceKind) -> bool {
        self.reauth_required.read().await.contains(&service)
    }

    /// Services whose token expires within the leeway window and that have a
    /// refresh token to spend. This is what the proactive refresh worker wakes for.
    pub async fn services_due_for_refresh(&self, now: DateTime<Utc>) -> Result<Vec<ServiceKind>> {
        let reauth = self.reauth_required.read().await.clone();
        let tokens = self.store.all().await?;
        Ok(tokens
            .into_iter()
            .filter(|t| {
                t.refresh_token.is_some()
                    && !t.is_fresh(now, self.leeway)
                    && !reauth.contains(&t.service)
            })
            .map(|t| t.service)
            .collect())
    }

    /// Refresh the service's token if stale; used by the background worker.
    pub async fn ensure_fresh(&self, service: ServiceKind) -> Result<()> {
        self.get_access_token(service).await.map(|_| ())
    }

    async fn current(&self, service: ServiceKind) -> Result<Option<ServiceToken>> {
        if let Some(token) = self.cache.read().await.get(&service) {
            return Ok(Some(token.clone()));
        }

        let loaded = match self.store.get(service).await {
            Ok(token) => token,
            // One retry on repository errors, then surface
            Err(AppError::Database(_)) => self.store.get(service).await?,
            Err(e) => return Err(e),
        };

        if let Some(token) = &loaded {
            self.cache.write().await.insert(service, token.clone());
        }
        Ok(loaded)
    }

    async fn refresh_locked(&self, service: ServiceKind, stale: ServiceToken) -> Result<String> {
        let Some(refresh_token) = stale.refresh_token.clone() else {
            self.reauth_required.write().await.insert(service);
            return Err(AppError::NeedsReauthentication {
                service: service.to_string(),
            });
        };

        let endpoint = self.endpoints.get(&service).ok_or_else(|| {
            AppError::Configuration(format!("no authorization endpoint for {service}"))
        })?;

        match endpoint.refresh(&refresh_token).await {
            Ok(response) => {
                let token = response.into_token(service, Some(refresh_token));
                self.persist_with_retry(&token).await?;
                let access_token = token.access_token.clone();
                self.cache.write().await.insert(service, token);
                info!(service = %service, "Refreshed service token");
                Ok(access_token)
            }
            Err(AppError::NeedsReauthentication { .. }) => {
                warn!(service = %service, "Token refresh rejected, re-authentication required");
                self.reauth_required.write().await.insert(service);
                Err(AppError::NeedsReauthentication {
                    service: service.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn persist_with_retry(&self, token: &ServiceToken) -> Result<()> {
        match self.store.upsert(token).await {
            Ok(()) => Ok(()),
            Err(AppError::Database(_)) => self.store.upsert(token).await,
            Err(e) => Err(e),
        }
    }
}

/// Cycle statistics for the proactive refresh worker
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TokenRefreshStats {
    pub last_run_at: Option<DateTime<Utc>>,
    pub refreshed_total: u64,
    pub failures_total: u64,
    pub skipped_reauth_total: u64,
    pub sessions_purged_total: u64,
}

/// Background worker that refreshes tokens shortly before they expire, so
/// callers rarely pay the refresh latency, and sweeps expired sessions.
pub struct TokenRefreshWorker {
    manager: Arc<TokenManager>,
    sessions: Arc<SessionStore>,
    check_interval: std::time::Duration,
    stats: Mutex<TokenRefreshStats>,
}

impl TokenRefreshWorker {
    pub fn new(
        manager: Arc<TokenManager>,
        sessions: Arc<SessionStore>,
        settings: &TokenSettings,
    ) -> Self {
        Self {
            manager,
            sessions,
            check_interval: settings.refresh_check_interval,
            stats: Mutex::new(TokenRefreshStats::default()),
        }
    }

    pub async fn stats(&self) -> TokenRefreshStats {
        self.stats.lock().await.clone()
    }

    pub async fn run_cycle(&self) {
        let purged = self.sessions.purge_expired().await;

        let due = match self.manager.services_due_for_refresh(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Could not query tokens due for refresh");
                Vec::new()
            }
        };

        let mut stats = self.stats.lock().await;
        stats.last_run_at = Some(Utc::now());
        stats.sessions_purged_total += purged as u64;
        drop(stats);

        for service in due {
            match self.manager.ensure_fresh(service).await {
                Ok(()) => {
                    self.stats.lock().await.refreshed_total += 1;
                }
                Err(AppError::NeedsReauthentication { .. }) => {
                    // Not an outage: nothing to do until the user logs in again
                    info!(service = %service, "Skipping refresh, service needs re-authentication");
                    self.stats.lock().await.skipped_reauth_total += 1;
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "Proactive token refresh failed");
                    self.stats.lock().await.failures_total += 1;
                }
            }
        }
    }
}

#[async_trait]
impl BackgroundWorker for TokenRefreshWorker {
    fn name(&self) -> &'static str {
        "token_refresh"
    }

    async fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats().await).unwrap_or(serde_json::Value::Null)
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = interval.tick() => self.run_cycle().await,
            }
        }
    }
}
