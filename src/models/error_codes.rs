//! Standardized download error codes.
//!
//! External clients report failures as free text ("file not found", "File Not
//! Found", "FILE_NOT_FOUND"). Everything that touches a failed download goes
//! through this closed taxonomy instead, so retry decisions and user-facing
//! descriptions stay consistent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical error codes for download failures.
///
/// Codes are partitioned into non-retryable (permanent failures) and
/// retryable (transient issues worth another attempt after backoff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorCode {
    // Non-retryable
    FileNotFound,
    UserBlocked,
    InvalidFile,
    FileTooSmall,

    // Retryable
    Timeout,
    UserOffline,
    TransferFailed,
    QueueTimeout,
    ConnectionError,
    RateLimited,
    ServiceUnavailable,
    Unknown,
}

/// Result of classifying a code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    NonRetryable,
}

impl DownloadErrorCode {
    pub const ALL: [DownloadErrorCode; 12] = [
        DownloadErrorCode::FileNotFound,
        DownloadErrorCode::UserBlocked,
        DownloadErrorCode::InvalidFile,
        DownloadErrorCode::FileTooSmall,
        DownloadErrorCode::Timeout,
        DownloadErrorCode::UserOffline,
        DownloadErrorCode::TransferFailed,
        DownloadErrorCode::QueueTimeout,
        DownloadErrorCode::ConnectionError,
        DownloadErrorCode::RateLimited,
        DownloadErrorCode::ServiceUnavailable,
        DownloadErrorCode::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadErrorCode::FileNotFound => "file_not_found",
            DownloadErrorCode::UserBlocked => "user_blocked",
            DownloadErrorCode::InvalidFile => "invalid_file",
            DownloadErrorCode::FileTooSmall => "file_too_small",
            DownloadErrorCode::Timeout => "timeout",
            DownloadErrorCode::UserOffline => "user_offline",
            DownloadErrorCode::TransferFailed => "transfer_failed",
            DownloadErrorCode::QueueTimeout => "queue_timeout",
            DownloadErrorCode::ConnectionError => "connection_error",
            DownloadErrorCode::RateLimited => "rate_limited",
            DownloadErrorCode::ServiceUnavailable => "service_unavailable",
            DownloadErrorCode::Unknown => "unknown",
        }
    }

    /// Classify a code as retryable or not
    pub fn classify(&self) -> Retryability {
        match self {
            DownloadErrorCode::FileNotFound
            | DownloadErrorCode::UserBlocked
            | DownloadErrorCode::InvalidFile
            | DownloadErrorCode::FileTooSmall => Retryability::NonRetryable,
            _ => Retryability::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == Retryability::Retryable
    }

    /// Human-readable description for display next to a failed download
    pub fn describe(&self) -> &'static str {
        match self {
            DownloadErrorCode::FileNotFound => "File not found on the peer network",
            DownloadErrorCode::UserBlocked => "Blocked by the sharing user",
            DownloadErrorCode::InvalidFile => "Downloaded file is corrupted or invalid",
            DownloadErrorCode::FileTooSmall => "File smaller than the minimum size threshold",
            DownloadErrorCode::Timeout => "Connection timed out",
            DownloadErrorCode::UserOffline => "User went offline during the download",
            DownloadErrorCode::TransferFailed => "Transfer failed (network error)",
            DownloadErrorCode::QueueTimeout => "Waited too long in the remote queue",
            DownloadErrorCode::ConnectionError => "Could not connect to the user",
            DownloadErrorCode::RateLimited => "Too many requests (rate limited)",
            DownloadErrorCode::ServiceUnavailable => "Download service is unavailable",
            DownloadErrorCode::Unknown => "Unknown error occurred",
        }
    }

    /// Normalize a free-text error message to a canonical code.
    ///
    /// Case-folded substring match against a fixed rule table; `None` or no
    /// match yields `Unknown`. Total and deterministic: rule order decides
    /// when multiple patterns would match.
    pub fn normalize(raw_error: Option<&str>) -> DownloadErrorCode {
        let Some(raw) = raw_error else {
            return DownloadErrorCode::Unknown;
        };
        let lower = raw.to_lowercase();

        const RULES: &[(&[&str], DownloadErrorCode)] = &[
            (
                &["file not found", "not found", "does not exist"],
                DownloadErrorCode::FileNotFound,
            ),
            (&["blocked", "banned", "denied"], DownloadErrorCode::UserBlocked),
            (
                &["corrupt", "invalid", "bad file", "malformed"],
                DownloadErrorCode::InvalidFile,
            ),
            (
                &["too small", "zero bytes", "empty file"],
                DownloadErrorCode::FileTooSmall,
            ),
            (&["timeout", "timed out"], DownloadErrorCode::Timeout),
            (&["offline", "not online"], DownloadErrorCode::UserOffline),
            (
                &["transfer failed", "transfer error", "aborted"],
                DownloadErrorCode::TransferFailed,
            ),
            (&["queue", "queued too long"], DownloadErrorCode::QueueTimeout),
            (
                &["connection", "connect", "network"],
                DownloadErrorCode::ConnectionError,
            ),
            (&["rate limit", "too many"], DownloadErrorCode::RateLimited),
            (
                &["service unavailable", "unavailable", "503"],
                DownloadErrorCode::ServiceUnavailable,
            ),
        ];

        for (patterns, code) in RULES {
            if patterns.iter().any(|p| lower.contains(p)) {
                return *code;
            }
        }

        DownloadErrorCode::Unknown
    }
}

impl fmt::Display for DownloadErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DownloadErrorCode::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown download error code: {s}"))
    }
}
