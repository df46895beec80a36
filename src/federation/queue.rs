//! Persistent work queue
//!
//! Items live in the `queue` table and survive restarts. A worker polls
//! for due items, hands each to a [`QueueHandler`] and applies the
//! returned [`QueueAction`]. An item is never processed by two tasks at
//! the same time.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::data::{Database, QueueItem};
use crate::error::AppError;
use crate::metrics::QUEUE_DEPTH;

/// What to do with an item after it was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    /// Remove the item for good
    Dequeue,
    /// Store `content` and run the item again after `delay`
    Reschedule { content: Vec<u8>, delay: Duration },
}

/// Processes the items of one queue
pub trait QueueHandler: Send + Sync + 'static {
    fn handle(&self, item: QueueItem) -> impl Future<Output = QueueAction> + Send;
}

/// Handle for adding items to a named queue
#[derive(Clone)]
pub struct Queue {
    db: Arc<Database>,
    name: String,
    wake: Arc<Notify>,
}

impl Queue {
    pub fn new(db: Arc<Database>, name: &str) -> Self {
        Self {
            db,
            name: name.to_string(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persist an item due at `run_at` and wake the worker
    pub async fn enqueue(&self, content: &[u8], run_at: DateTime<Utc>) -> Result<String, AppError> {
        let id = self.db.enqueue(&self.name, content, run_at).await?;
        QUEUE_DEPTH.with_label_values(&[self.name.as_str()]).inc();
        self.wake.notify_one();
        Ok(id)
    }

    /// Create the worker draining this queue
    pub fn worker<H: QueueHandler>(&self, handler: H, settings: WorkerSettings) -> QueueWorker<H> {
        QueueWorker {
            queue: self.clone(),
            handler: Arc::new(handler),
            settings,
        }
    }
}

/// Due items loaded per pass, as a multiple of `max_concurrent`
const BATCH_FACTOR: usize = 4;

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    /// Upper bound on items loaded (and tasks spawned) per pass
    pub batch_size: usize,
    pub shutdown_grace: Duration,
}

impl From<&crate::config::QueueConfig> for WorkerSettings {
    fn from(config: &crate::config::QueueConfig) -> Self {
        let max_concurrent = config.max_concurrent_deliveries.max(1);
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            max_concurrent,
            batch_size: max_concurrent.saturating_mul(BATCH_FACTOR),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
        }
    }
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Removes an item id from the in-flight set when its task ends,
/// including when the handler panics
struct InFlightGuard {
    in_flight: InFlight,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct QueueWorker<H> {
    queue: Queue,
    handler: Arc<H>,
    settings: WorkerSettings,
}

impl<H: QueueHandler> QueueWorker<H> {
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Poll until `shutdown` turns true, then give running items
    /// `shutdown_grace` to finish before aborting them
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = JoinSet::new();

        tracing::info!(queue = %self.queue.name, "Queue worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = self.queue.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(queue = %self.queue.name, "Queue task failed: {}", e);
                }
            }

            self.dispatch_due(&mut tasks, &semaphore, &in_flight).await;
        }

        tracing::info!(
            queue = %self.queue.name,
            running = tasks.len(),
            "Queue worker stopping"
        );

        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                queue = %self.queue.name,
                "Shutdown grace period elapsed, aborting {} running items",
                tasks.len()
            );
            tasks.abort_all();
        }
    }

    async fn dispatch_due(
        &self,
        tasks: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        in_flight: &InFlight,
    ) {
        let db = &self.queue.db;
        let name = self.queue.name.as_str();

        match db.queue_len(name).await {
            Ok(depth) => QUEUE_DEPTH.with_label_values(&[name]).set(depth),
            Err(e) => tracing::warn!(queue = %name, "Failed to count queue items: {}", e),
        }

        let items = match db
            .due_queue_items(name, Utc::now(), self.settings.batch_size)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(queue = %name, "Failed to load due items: {}", e);
                return;
            }
        };

        for item in items {
            let newly_claimed = in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(item.id.clone());
            if !newly_claimed {
                continue;
            }

            let guard = InFlightGuard {
                in_flight: Arc::clone(in_flight),
                id: item.id.clone(),
            };
            let semaphore = Arc::clone(semaphore);
            let handler = Arc::clone(&self.handler);
            let db = Arc::clone(db);
            let name = name.to_string();
            let wake = Arc::clone(&self.queue.wake);

            tasks.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };

                let id = item.id.clone();
                let action = handler.handle(item).await;
                if apply_action(&db, &name, &id, action).await {
                    // A slot opened up; load the next page without waiting for a tick
                    wake.notify_one();
                }
            });
        }
    }
}

/// Longest delay a rescheduled item is stored with
const MAX_RESCHEDULE_DAYS: i64 = 365;

fn reschedule_at(delay: Duration) -> DateTime<Utc> {
    let cap = chrono::Duration::days(MAX_RESCHEDULE_DAYS);
    let delay = chrono::Duration::from_std(delay)
        .ok()
        .filter(|delay| *delay <= cap)
        .unwrap_or(cap);
    Utc::now() + delay
}

/// Returns whether the queue row was updated
async fn apply_action(db: &Database, queue: &str, id: &str, action: QueueAction) -> bool {
    let result = match action {
        QueueAction::Dequeue => {
            let result = db.dequeue(id).await;
            if result.is_ok() {
                QUEUE_DEPTH.with_label_values(&[queue]).dec();
            }
            result
        }
        QueueAction::Reschedule { content, delay } => {
            db.reschedule_queue_item(id, &content, reschedule_at(delay))
                .await
        }
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(queue = %queue, item = %id, "Failed to update queue item: {}", e);
            false
        }
    }
}
