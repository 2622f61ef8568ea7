//! Download entity and its lifecycle state machine.
//!
//! A `Download` tracks one track acquisition from "the user wants this" to a
//! file on disk. The entity owns every transition rule; persistence happens
//! separately through the repository so illegal transitions are rejected
//! before they reach the database.
//!
//! ```text
//! created → waiting → pending → queued → downloading → completed
//!                ^                                |
//!                └──────────── failed ←───────────┘
//!                                 |
//!                                 └→ blocklisted
//! any non-terminal → cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error_codes::DownloadErrorCode;
use super::work_item::retry_backoff;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Created, not yet picked up by the queue worker
    Waiting,
    /// Dispatch work item enqueued, submission to the external client pending
    Pending,
    /// Accepted by the external client, waiting for transfer start
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
    Blocklisted,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Waiting => "waiting",
            DownloadStatus::Pending => "pending",
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Blocklisted => "blocklisted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Cancelled | DownloadStatus::Blocklisted
        )
    }

    /// States in which the download is still being worked on and a failure
    /// report from the external client is meaningful.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Waiting
                | DownloadStatus::Pending
                | DownloadStatus::Queued
                | DownloadStatus::Downloading
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(DownloadStatus::Waiting),
            "pending" => Ok(DownloadStatus::Pending),
            "queued" => Ok(DownloadStatus::Queued),
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            "blocklisted" => Ok(DownloadStatus::Blocklisted),
            other => Err(format!("unknown download status: {other}")),
        }
    }
}

/// One track the user wants acquired
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: Uuid,
    pub track_id: Uuid,
    pub status: DownloadStatus,
    pub priority: i32,
    pub progress_percent: f64,
    /// Source peer on the download network
    pub username: Option<String>,
    /// Remote file path on the peer's share
    pub filename: Option<String>,
    /// External client's identifier once submitted
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub last_error_code: Option<DownloadErrorCode>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Download {
    pub fn new(track_id: Uuid, username: String, filename: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            track_id,
            status: DownloadStatus::Waiting,
            priority: 0,
            progress_percent: 0.0,
            username: Some(username),
            filename: Some(filename),
            external_id: None,
            error_message: None,
            last_error_code: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether a transition from `from` to `to` is permitted
    pub fn can_transition(from: DownloadStatus, to: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (from, to) {
            (Waiting, Pending) => true,
            (Pending, Queued) => true,
            // The external client can report progress before we ever saw it
            // in its queue, so pending may jump straight to downloading.
            (Pending, Downloading) | (Queued, Downloading) => true,
            (Downloading, Completed) => true,
            (from, Failed) => from.is_active(),
            (Failed, Waiting) => true,
            (Failed, Blocklisted) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Apply a transition, enforcing the state machine and bookkeeping
    /// timestamps. Prefer the specific methods (`record_failure`,
    /// `activate_for_retry`, `mark_completed`) where they exist.
    pub fn transition(&mut self, to: DownloadStatus) -> Result<()> {
        if !Self::can_transition(self.status, to) {
            return Err(AppError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        if to == DownloadStatus::Downloading && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = to;
        Ok(())
    }

    /// Record a failure reported by the external client (or the dispatcher).
    ///
    /// Retryable failures below the retry cap get their next attempt
    /// scheduled with the shared backoff; everything else stays in `failed`
    /// with no `next_retry_at` until an operator intervenes.
    pub fn record_failure(&mut self, code: DownloadErrorCode, message: &str) -> Result<()> {
        if !self.status.is_active() {
            return Err(AppError::InvalidTransition {
                from: self.status.to_string(),
                to: DownloadStatus::Failed.to_string(),
            });
        }

        let now = Utc::now();
        self.status = DownloadStatus::Failed;
        self.last_error_code = Some(code);
        self.error_message = Some(message.to_string());

        if code.is_retryable() && self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.next_retry_at = Some(now + retry_backoff(self.retry_count));
        } else {
            self.next_retry_at = None;
        }

        Ok(())
    }

    /// Whether this download is currently eligible for automatic retry
    pub fn should_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == DownloadStatus::Failed
            && self.last_error_code.map(|c| c.is_retryable()).unwrap_or(true)
            && self.retry_count <= self.max_retries
            && self.next_retry_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Move an eligible failed download back to `waiting` for re-dispatch.
    /// Preserves `retry_count` so the backoff keeps growing across attempts.
    pub fn activate_for_retry(&mut self) -> Result<()> {
        let now = Utc::now();
        if !self.should_retry(now) {
            return Err(AppError::Validation(format!(
                "download {} is not eligible for retry (status={}, error_code={:?}, next_retry_at={:?})",
                self.id, self.status, self.last_error_code, self.next_retry_at
            )));
        }

        self.status = DownloadStatus::Waiting;
        self.next_retry_at = None;
        self.progress_percent = 0.0;
        self.external_id = None;
        Ok(())
    }

    /// Terminal success; the caller must have written the track's file path
    /// first, since a completed download without a local file is invalid.
    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(DownloadStatus::Completed)?;
        self.progress_percent = 100.0;
        self.error_message = None;
        Ok(())
    }
}
