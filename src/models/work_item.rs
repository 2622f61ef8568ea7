//! Work items: the durable unit of background work.
//!
//! Rows live in `background_jobs`. A worker takes exclusive ownership of an
//! item by writing its lease (`locked_by`, `locked_at`) while flipping the
//! status to `running`; the lease is what makes "at most one concurrent
//! handler per item" enforceable across processes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Task types handled through the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    ArtistSync,
    AlbumSync,
    TrackSync,
    Enrichment,
    DownloadRequest,
    DownloadDispatch,
    Cleanup,
}

impl WorkItemType {
    pub const ALL: [WorkItemType; 7] = [
        WorkItemType::ArtistSync,
        WorkItemType::AlbumSync,
        WorkItemType::TrackSync,
        WorkItemType::Enrichment,
        WorkItemType::DownloadRequest,
        WorkItemType::DownloadDispatch,
        WorkItemType::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemType::ArtistSync => "artist_sync",
            WorkItemType::AlbumSync => "album_sync",
            WorkItemType::TrackSync => "track_sync",
            WorkItemType::Enrichment => "enrichment",
            WorkItemType::DownloadRequest => "download_request",
            WorkItemType::DownloadDispatch => "download.dispatch",
            WorkItemType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for WorkItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkItemType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown work item type: {s}"))
    }
}

/// Work item lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Running => "running",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed | WorkItemStatus::Failed | WorkItemStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkItemStatus::Pending),
            "running" => Ok(WorkItemStatus::Running),
            "completed" => Ok(WorkItemStatus::Completed),
            "failed" => Ok(WorkItemStatus::Failed),
            "cancelled" => Ok(WorkItemStatus::Cancelled),
            other => Err(format!("unknown work item status: {other}")),
        }
    }
}

/// A persisted unit of background work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub job_type: WorkItemType,
    pub status: WorkItemStatus,
    /// Higher runs earlier; ties break oldest-first
    pub priority: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retries: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Items with a future `next_run_at` are not eligible for dequeue
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Parameters for inserting a new work item
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub job_type: WorkItemType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: i32,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewWorkItem {
    pub fn new(job_type: WorkItemType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            priority: 0,
            max_retries: 3,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// Shared backoff schedule for failed work items and failed downloads.
///
/// 1 min, 5 min, 15 min; further retries clamp at 15 min.
pub fn retry_backoff(retry_count: i32) -> Duration {
    match retry_count {
        i32::MIN..=1 => Duration::minutes(1),
        2 => Duration::minutes(5),
        _ => Duration::minutes(15),
    }
}
