//! In-memory TTL store for browser sessions.
//!
//! Sessions carry OAuth state and PKCE verifiers across an authorization
//! round trip; they are not the token store and nothing in them survives a
//! restart. Expired entries are dropped lazily on access and swept
//! periodically by the token refresh worker.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::session::Session;

pub struct SessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create and store a fresh session, returning a copy
    pub async fn create(&self) -> Session {
        let session = Session::new();
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Look up a session, refreshing its idle timer. Expired sessions are
    /// removed and reported as absent.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.is_expired(Utc::now(), self.ttl) => {
                sessions.remove(session_id);
                None
            }
            Some(session) => {
                session.touch();
                Some(session.clone())
            }
            None => None,
        }
    }

    /// Write back a modified session
    pub async fn update(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session);
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Drop every expired session; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now, self.ttl));
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
