//! The persistent work-item queue and its worker pool.
//!
//! `WorkQueueService` pairs the durable store with a registry of handlers
//! keyed by work-item type. Worker loops pull the highest-priority eligible
//! item, run its handler, and settle the outcome; the store's row locking
//! guarantees no two loops ever receive the same item.
//!
//! Failure semantics inside a handler: an `Err` becomes `fail(id, message)`
//! and takes the retry/backoff path. A panic deliberately leaves the item
//! `running`; the stale-lease sweep reclaims it, which is also how items
//! orphaned by a crash recover after restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::orchestrator::BackgroundWorker;
use crate::config::QueueSettings;
use crate::error::{AppError, Result};
use crate::metrics::MetricsCollector;
use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemStatus, WorkItemType};
use crate::repositories::work_items::{QueueDepth, WorkItemFilter, WorkItemStore};

/// What a handler did with its work item
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Work finished; the item completes with this result
    Completed(serde_json::Value),
    /// The item stays `running`; an external reconciler (the status worker)
    /// settles it once the real-world outcome is known
    Deferred,
}

/// The function bound to a work-item type; invoked exactly once per dequeue
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> Result<HandlerOutcome>;
}

pub struct WorkQueueService {
    store: Arc<dyn WorkItemStore>,
    handlers: RwLock<HashMap<WorkItemType, Arc<dyn WorkItemHandler>>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WorkQueueService {
    pub fn new(store: Arc<dyn WorkItemStore>) -> Self {
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> Arc<dyn WorkItemStore> {
        Arc::clone(&self.store)
    }

    /// Bind a handler to a work-item type. Double registration is a bug.
    pub async fn register_handler(
        &self,
        job_type: WorkItemType,
        handler: Arc<dyn WorkItemHandler>,
    ) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&job_type) {
            return Err(AppError::Validation(format!(
                "handler already registered for {job_type}"
            )));
        }
        handlers.insert(job_type, handler);
        Ok(())
    }

    pub async fn registered_types(&self) -> Vec<WorkItemType> {
        self.handlers.read().await.keys().copied().collect()
    }

    /// Insert a pending item. The type is only recorded here; its handler
    /// may be registered later, and the item waits until it is.
    pub async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItem> {
        let item = self.store.insert(item).await?;
        info!(
            work_item = %item.id,
            job_type = %item.job_type,
            priority = item.priority,
            "Enqueued work item"
        );
        Ok(item)
    }

    /// Claim the next eligible item for this worker. `types` defaults to
    /// every type with a registered handler, so items of unhandled types
    /// simply stay pending.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        types: Option<&[WorkItemType]>,
    ) -> Result<Option<WorkItem>> {
        match types {
            Some(types) => self.store.acquire_next(worker_id, types).await,
            None => {
                let registered = self.registered_types().await;
                self.store.acquire_next(worker_id, &registered).await
            }
        }
    }

    pub async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        self.store.complete(id, worker_id, result).await
    }

    pub async fn fail(&self, id: Uuid, worker_id: &str, message: &str) -> Result<WorkItemStatus> {
        self.store.fail(id, worker_id, message).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        self.store.cancel(id).await
    }

    /// Reclaim `running` items whose lease has gone stale. Retries are not
    /// charged: the handler never reported an outcome.
    pub async fn cleanup_stale(&self, threshold: Duration) -> Result<Vec<Uuid>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| AppError::Validation(format!("bad stale threshold: {e}")))?;
        let reclaimed = self.store.release_stale(threshold).await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "Reclaimed stale work-item leases");
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<WorkItem>> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: WorkItemFilter) -> Result<Vec<WorkItem>> {
        self.store.list(filter).await
    }

    pub async fn queue_depths(&self) -> Result<Vec<QueueDepth>> {
        self.store.queue_depths().await
    }

    /// Dequeue and run one item. Returns false when the queue was empty.
    pub async fn process_one(&self, worker_id: &str) -> Result<bool> {
        let Some(item) = self.dequeue(worker_id, None).await? else {
            return Ok(false);
        };

        let handler = self.handlers.read().await.get(&item.job_type).cloned();
        let Some(handler) = handler else {
            // Possible when a handler set shrinks between dequeue and here
            self.fail(item.id, worker_id, "no handler registered").await?;
            return Ok(true);
        };

        let item_id = item.id;
        let job_type = item.job_type;
        debug!(work_item = %item_id, job_type = %job_type, worker = worker_id, "Running handler");

        // Handlers run in their own task so a panic does not kill the worker
        // loop. A panicked item keeps its lease until the stale sweep.
        let run = tokio::spawn(async move { handler.handle(&item).await });

        match run.await {
            Ok(Ok(HandlerOutcome::Completed(result))) => {
                self.complete(item_id, worker_id, result).await?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_work_item(job_type.as_str(), "completed");
                }
            }
            Ok(Ok(HandlerOutcome::Deferred)) => {
                debug!(work_item = %item_id, "Handler deferred settlement to the status worker");
            }
            Ok(Err(e)) => {
                let status = self.fail(item_id, worker_id, &e.to_string()).await?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_work_item(job_type.as_str(), "failed");
                }
                warn!(
                    work_item = %item_id,
                    job_type = %job_type,
                    error = %e,
                    status = %status,
                    "Handler failed"
                );
            }
            Err(join_err) => {
                error!(
                    work_item = %item_id,
                    job_type = %job_type,
                    error = %join_err,
                    "Handler panicked; item stays leased until the stale sweep"
                );
            }
        }

        Ok(true)
    }
}

/// Pool of work-item processing loops plus the periodic stale-lease sweep
pub struct QueueWorkerPool {
    queue: Arc<WorkQueueService>,
    worker_count: usize,
    stale_lease_threshold: Duration,
    idle_poll: Duration,
    items_processed: AtomicU64,
}

impl QueueWorkerPool {
    pub fn new(queue: Arc<WorkQueueService>, settings: &QueueSettings) -> Self {
        Self {
            queue,
            worker_count: settings.worker_count.max(1),
            stale_lease_threshold: settings.stale_lease_threshold,
            idle_poll: Duration::from_secs(1),
            items_processed: AtomicU64::new(0),
        }
    }

    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BackgroundWorker for QueueWorkerPool {
    fn name(&self) -> &'static str {
        "work_queue"
    }

    async fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "items_processed_total": self.items_processed(),
            "worker_count": self.worker_count,
        })
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Crash recovery: anything still leased from a previous process is
        // fair game again before the first dequeue.
        self.queue.cleanup_stale(self.stale_lease_threshold).await?;

        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..self.worker_count {
            let pool = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            let worker_id = format!("queue-worker-{index}-{}", &Uuid::new_v4().to_string()[..8]);

            tasks.spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let worked = tokio::select! {
                        _ = shutdown.changed() => break,
                        result = pool.queue.process_one(&worker_id) => match result {
                            Ok(worked) => worked,
                            Err(e) => {
                                warn!(worker = %worker_id, error = %e, "Work-item processing error");
                                false
                            }
                        },
                    };

                    if worked {
                        pool.items_processed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(pool.idle_poll) => {}
                        }
                    }
                }
            });
        }

        // Periodic stale sweep alongside the loops
        let mut sweep = tokio::time::interval(Duration::from_secs(60));
        sweep.tick().await; // first tick fires immediately and was done above
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sweep.tick() => {
                    if let Err(e) = self.queue.cleanup_stale(self.stale_lease_threshold).await {
                        warn!(error = %e, "Stale-lease sweep failed");
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}
