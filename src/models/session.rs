//! Ephemeral browser sessions.
//!
//! A session only exists to carry OAuth state and the PKCE verifier across
//! an authorization round trip, plus an optional short-lived copy of the
//! bearer token for multi-device clients. It is never the token store.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::token::ServiceKind;

/// Ephemeral per-browser state, keyed by an opaque cookie value
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// CSRF state issued for an in-flight authorization redirect
    pub oauth_state: Option<String>,
    /// PKCE verifier matching the challenge sent with the redirect
    pub pkce_verifier: Option<String>,
    /// Which service the in-flight authorization belongs to
    pub pending_service: Option<ServiceKind>,
    /// Short-lived bearer copy handed to secondary devices
    pub bearer_token: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: generate_session_id(),
            created_at: now,
            last_accessed_at: now,
            oauth_state: None,
            pkce_verifier: None,
            pending_service: None,
            bearer_token: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_accessed_at > ttl
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// 32 random bytes, base64url, 256 bits of entropy in the cookie value
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A PKCE verifier/challenge pair (S256)
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    pub fn challenge_for(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }
}
