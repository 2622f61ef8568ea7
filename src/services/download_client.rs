//! External download client contract.
//!
//! The workers never talk to a concrete daemon; they see this trait plus the
//! provider-agnostic `ExternalDownload` record. The `state` field arrives as
//! free text and is mapped to our own states through a fixed table.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::library::Track;

/// A transfer as reported by the external client
#[derive(Debug, Clone)]
pub struct ExternalDownload {
    pub external_id: String,
    pub filename: String,
    pub username: Option<String>,
    /// Free-text state string from the client
    pub state: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub progress_percent: f64,
    pub error_message: Option<String>,
}

/// Our reading of an external client's state string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalState {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl ExternalDownload {
    /// Map the free-text state to a known value. Failure tokens are checked
    /// before success tokens because clients report compound states like
    /// "Completed, Errored". Unknown strings map to `Queued`.
    pub fn mapped_state(&self) -> ExternalState {
        map_external_state(&self.state)
    }
}

pub fn map_external_state(raw: &str) -> ExternalState {
    let state = raw.to_lowercase();
    let has = |token: &str| state.contains(token);

    if has("cancelled") || has("canceled") || has("aborted") || has("removed") {
        ExternalState::Cancelled
    } else if has("errored") || has("timedout") || has("rejected") || has("forbidden") {
        ExternalState::Failed
    } else if has("completed") || has("succeeded") {
        ExternalState::Completed
    } else if has("inprogress") || has("downloading") || has("initializing") {
        ExternalState::Downloading
    } else {
        // queued, requested, none, and anything we have never seen
        ExternalState::Queued
    }
}

/// Contract every download daemon adapter implements
#[async_trait]
pub trait ExternalDownloadClient: Send + Sync {
    /// Short name used for circuit breakers and logs
    fn name(&self) -> &str;

    /// Fast health probe; false means skip this cycle
    async fn is_available(&self) -> bool;

    /// All known non-historical downloads
    async fn list_downloads(&self) -> Result<Vec<ExternalDownload>>;

    async fn get_download(&self, external_id: &str) -> Result<Option<ExternalDownload>>;

    /// Submit a file for download; returns the client's external id
    async fn enqueue(&self, username: &str, filename: &str) -> Result<String>;

    /// Cancel a transfer; a no-op if it is already terminal
    async fn cancel(&self, external_id: &str) -> Result<()>;
}

/// A concrete peer and file chosen for a wanted track
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub username: String,
    pub filename: String,
}

/// The search layer's contract. Blocklist filtering happens behind this
/// boundary: a blocked source is simply never returned.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Name a source for the track, or `None` when nothing suitable is
    /// known yet.
    async fn resolve(&self, track: &Track) -> Result<Option<ResolvedSource>>;
}
