//! Per-language work queue: enqueue, lease, complete.
//!
//! A leased task stays in flight until it is completed or its lease lapses on
//! the store clock. A lapsed task goes back to the head of the pending
//! ordering, earliest expiry first, and the next `lease` call picks it up.
//! Delivery is therefore at-least-once; workers must tolerate running a task
//! twice.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::model::{Language, Task, TaskId};
use crate::store::{Claim, QueueDepth, Store, StoredItem};
use crate::telemetry::metrics;

/// Shortest pause between claim attempts while blocking.
const MIN_WAIT: Duration = Duration::from_millis(5);

/// A task held in flight by one caller.
#[derive(Debug, Clone)]
pub struct Lease {
    id: TaskId,
    body: String,
    token: u64,
    expires_in: Duration,
}

impl Lease {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Lease length granted by the store at claim time.
    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }

    /// Decode the leased task.
    pub fn task(&self) -> Result<Task> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Handle on one language's queue. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn Store>,
    language: Language,
    name: String,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn Store>, language: Language) -> Self {
        Self {
            store,
            language,
            name: language.queue_name(),
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize `task` and append it to the pending ordering.
    ///
    /// Fails with `DuplicateTask` if a task with the same id is pending or in
    /// flight, and with `StoreUnavailable` if the store cannot be reached; in
    /// both cases the task was not accepted.
    pub async fn enqueue(&self, task: &Task) -> Result<()> {
        let item = StoredItem {
            id: task.task_id.0.clone(),
            data: serde_json::to_string(task)?,
        };

        let queued = self.store.push(&self.name, &item).await;
        self.record("send", queued.as_ref().map(|q| *q).unwrap_or(false));

        if !queued? {
            return Err(Error::DuplicateTask(task.task_id.0.clone()));
        }
        tracing::debug!(queue = %self.name, task_id = %task.task_id, "task enqueued");
        Ok(())
    }

    /// Lease the next task for `timeout`.
    ///
    /// When nothing is claimable, waits up to `block` for a push or a lease
    /// expiry and returns `None` if the wait runs out. A zero `block` makes a
    /// single attempt.
    pub async fn lease(&self, timeout: Duration, block: Duration) -> Result<Option<Lease>> {
        let deadline = Instant::now() + block;

        loop {
            match self.store.claim(&self.name, timeout).await? {
                Claim::Leased {
                    item,
                    token,
                    expires_in,
                } => {
                    self.record("lease", true);
                    return Ok(Some(Lease {
                        id: TaskId(item.id),
                        body: item.data,
                        token,
                        expires_in,
                    }));
                }
                Claim::Empty { next_expiry } => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.record("lease", false);
                        return Ok(None);
                    }
                    let mut wait = deadline - now;
                    if let Some(expiry) = next_expiry {
                        wait = wait.min(expiry.max(MIN_WAIT));
                    }
                    self.store.wait_for_push(&self.name, wait).await?;
                }
            }
        }
    }

    /// Permanently remove a leased task.
    ///
    /// Returns false if the lease had already lapsed: the task may be
    /// re-delivered, so the caller's work may be duplicated. That is a
    /// warning, not an error.
    pub async fn complete(&self, lease: &Lease) -> Result<bool> {
        let removed = self
            .store
            .remove(&self.name, &lease.id.0, lease.token)
            .await?;
        self.record("complete", removed);
        Ok(removed)
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        self.store.depth(&self.name).await
    }

    fn record(&self, operation: &'static str, hit: bool) {
        let operation = match (operation, hit) {
            ("lease", false) => "lease_empty",
            ("complete", false) => "complete_expired",
            ("send", false) => "send_rejected",
            (op, _) => op,
        };
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}
