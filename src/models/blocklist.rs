//! Blocklist entries for download sources that keep failing.
//!
//! After enough failures from the same `(username, filepath)` pair the queue
//! worker writes one of these; the search layer filters blocked sources out
//! before new downloads are ever created against them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error_codes::DownloadErrorCode;

/// What a blocklist entry applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlocklistScope {
    /// Every file from this user
    Username,
    /// This file path from any user
    Filepath,
    /// Only this file from this user
    Specific,
}

impl BlocklistScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlocklistScope::Username => "username",
            BlocklistScope::Filepath => "filepath",
            BlocklistScope::Specific => "specific",
        }
    }

    /// Scope chosen from the failure reason: a blocking user taints all of
    /// their files, a missing file taints the path everywhere, anything else
    /// only blocks the exact pair.
    pub fn for_reason(reason: DownloadErrorCode) -> Self {
        match reason {
            DownloadErrorCode::UserBlocked => BlocklistScope::Username,
            DownloadErrorCode::FileNotFound => BlocklistScope::Filepath,
            _ => BlocklistScope::Specific,
        }
    }
}

impl fmt::Display for BlocklistScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlocklistScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "username" => Ok(BlocklistScope::Username),
            "filepath" => Ok(BlocklistScope::Filepath),
            "specific" => Ok(BlocklistScope::Specific),
            other => Err(format!("unknown blocklist scope: {other}")),
        }
    }
}

/// A record of a bad source to avoid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistEntry {
    pub id: Uuid,
    pub username: Option<String>,
    pub filepath: Option<String>,
    pub scope: BlocklistScope,
    pub reason: Option<DownloadErrorCode>,
    pub failure_count: i32,
    pub blocked_at: DateTime<Utc>,
    /// None = permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub is_manual: bool,
}

impl BlocklistEntry {
    /// Build an automatic entry for a failing source. User blocks are
    /// permanent; everything else expires after `ttl`.
    pub fn automatic(
        username: Option<String>,
        filepath: Option<String>,
        reason: DownloadErrorCode,
        failure_count: i32,
        ttl: Duration,
    ) -> Self {
        let scope = BlocklistScope::for_reason(reason);
        let expires_at = match reason {
            DownloadErrorCode::UserBlocked => None,
            _ => Some(Utc::now() + ttl),
        };

        Self {
            id: Uuid::new_v4(),
            username,
            filepath,
            scope,
            reason: Some(reason),
            failure_count,
            blocked_at: Utc::now(),
            expires_at,
            is_manual: false,
        }
    }

    /// An entry is active while unexpired
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}
