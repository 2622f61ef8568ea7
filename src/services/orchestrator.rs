//! Worker orchestrator: owns the lifecycle of every long-running worker.
//!
//! Workers start in dependency order and stop in reverse. Shutdown is
//! cooperative: each worker watches a signal and exits at its next loop
//! boundary; after the grace period the orchestrator abandons the task.
//! There is no auto-restart: a worker that fails stays `failed` until the
//! operator restarts the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A long-running background worker managed by the orchestrator
#[async_trait]
pub trait BackgroundWorker: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run until the shutdown signal flips to true. A clean exit returns Ok;
    /// an Err marks the worker failed.
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()>;

    /// Liveness beyond "the task has not crashed"; workers override this to
    /// report on their own cycle health.
    async fn is_healthy(&self) -> bool {
        true
    }

    /// Worker-specific cycle statistics (items promoted, polls, failures)
    /// for the status endpoint. Workers that keep counters override this.
    async fn stats_json(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Point-in-time status of one worker
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatusReport {
    pub name: &'static str,
    pub state: WorkerState,
    pub since: DateTime<Utc>,
    pub last_error: Option<String>,
    pub healthy: bool,
    /// Cycle counters reported by the worker itself
    pub stats: serde_json::Value,
}

#[derive(Debug, Clone)]
struct Lifecycle {
    state: WorkerState,
    since: DateTime<Utc>,
    last_error: Option<String>,
}

impl Lifecycle {
    fn transition(&mut self, state: WorkerState) {
        self.state = state;
        self.since = Utc::now();
    }
}

struct WorkerEntry {
    worker: Arc<dyn BackgroundWorker>,
    lifecycle: Arc<RwLock<Lifecycle>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

pub struct WorkerOrchestrator {
    shutdown_grace: Duration,
    entries: Mutex<Vec<WorkerEntry>>,
}

impl WorkerOrchestrator {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            shutdown_grace,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a worker. Registration order is start order; stop order is
    /// the reverse.
    pub async fn register(&self, worker: Arc<dyn BackgroundWorker>) {
        let (shutdown_tx, _) = watch::channel(false);
        self.entries.lock().await.push(WorkerEntry {
            worker,
            lifecycle: Arc::new(RwLock::new(Lifecycle {
                state: WorkerState::Stopped,
                since: Utc::now(),
                last_error: None,
            })),
            shutdown_tx,
            handle: None,
        });
    }

    pub async fn start_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            let name = entry.worker.name();
            {
                let mut lifecycle = entry.lifecycle.write().await;
                lifecycle.transition(WorkerState::Starting);
                lifecycle.last_error = None;
            }

            let worker = Arc::clone(&entry.worker);
            let lifecycle = Arc::clone(&entry.lifecycle);
            let shutdown_rx = entry.shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                lifecycle.write().await.transition(WorkerState::Running);
                info!(worker = name, "Worker started");

                match worker.run(shutdown_rx).await {
                    Ok(()) => {
                        lifecycle.write().await.transition(WorkerState::Stopped);
                        info!(worker = name, "Worker stopped");
                    }
                    Err(e) => {
                        let mut lifecycle = lifecycle.write().await;
                        lifecycle.transition(WorkerState::Failed);
                        lifecycle.last_error = Some(e.to_string());
                        error!(worker = name, error = %e, "Worker failed");
                    }
                }
            });
            entry.handle = Some(handle);
        }
    }

    /// Signal every worker to stop, newest first, and wait up to the grace
    /// period for each before abandoning it.
    pub async fn stop_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut().rev() {
            let name = entry.worker.name();
            {
                let mut lifecycle = entry.lifecycle.write().await;
                if lifecycle.state == WorkerState::Running {
                    lifecycle.transition(WorkerState::Stopping);
                }
            }
            let _ = entry.shutdown_tx.send(true);

            if let Some(handle) = entry.handle.take() {
                match tokio::time::timeout(self.shutdown_grace, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(join_err)) => {
                        warn!(worker = name, error = %join_err, "Worker task panicked during shutdown");
                        let mut lifecycle = entry.lifecycle.write().await;
                        lifecycle.transition(WorkerState::Failed);
                        lifecycle.last_error = Some(join_err.to_string());
                    }
                    Err(_) => {
                        warn!(worker = name, grace_secs = self.shutdown_grace.as_secs(),
                              "Worker did not stop within grace period, abandoning");
                        let mut lifecycle = entry.lifecycle.write().await;
                        lifecycle.transition(WorkerState::Stopped);
                        lifecycle.last_error = Some("shutdown grace exceeded".to_string());
                    }
                }
            }
        }
    }

    /// All workers running and reporting healthy
    pub async fn is_healthy(&self) -> bool {
        let entries = self.entries.lock().await;
        for entry in entries.iter() {
            if entry.lifecycle.read().await.state != WorkerState::Running {
                return false;
            }
            if !entry.worker.is_healthy().await {
                return false;
            }
        }
        true
    }

    pub async fn status(&self) -> Vec<WorkerStatusReport> {
        let entries = self.entries.lock().await;
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            let lifecycle = entry.lifecycle.read().await.clone();
            reports.push(WorkerStatusReport {
                name: entry.worker.name(),
                state: lifecycle.state,
                since: lifecycle.since,
                last_error: lifecycle.last_error,
                healthy: entry.worker.is_healthy().await,
                stats: entry.worker.stats_json().await,
            });
        }
        reports
    }
}
