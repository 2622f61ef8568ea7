//! Server-side OAuth credentials, one per external service.
//!
//! Tokens are shared across every device talking to this server; they are
//! not session-scoped. The token manager keeps at most one active row per
//! service and refreshes it before expiry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External services this server holds credentials for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Spotify,
    Deezer,
    Lastfm,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Spotify, ServiceKind::Deezer, ServiceKind::Lastfm];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Spotify => "spotify",
            ServiceKind::Deezer => "deezer",
            ServiceKind::Lastfm => "lastfm",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown service: {s}"))
    }
}

/// A persisted OAuth credential for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceToken {
    pub service: ServiceKind,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceToken {
    /// Whether the access token is still usable, with `leeway` subtracted so
    /// callers never receive a token about to die mid-request.
    pub fn is_fresh(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        !self.access_token.is_empty() && self.expires_at - leeway > now
    }
}

/// Token material returned by an authorization endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Fold a refresh response into the stored token. Providers do not
    /// always return a new refresh token, in which case the old one is kept.
    pub fn into_token(self, service: ServiceKind, previous_refresh: Option<String>) -> ServiceToken {
        ServiceToken {
            service,
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: Utc::now() + Duration::seconds(self.expires_in),
            scope: self.scope,
            updated_at: Utc::now(),
        }
    }
}
