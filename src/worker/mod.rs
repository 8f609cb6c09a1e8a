//! Worker loop: lease one task, execute it, publish its result, complete it.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Idle -> Leasing -> Leased -> Executing -> Publishing -> Completing -> Idle
//!            \-> Idle (nothing to lease)
//!            \-> ErrorBackoff -> Idle (store unreachable)
//! ```
//!
//! Only a failure to lease is a loop fault. A failing computation is data
//! (an error-bearing result), a lost publish is a warning, and a lapsed lease
//! at completion is a warning: the task may already belong to another worker.

pub mod eval;
pub mod executor;

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};
use uuid::Uuid;

use crate::model::{Language, Outcome, Task, TaskResult};
use crate::queue::{Lease, WorkQueue};
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

pub use executor::{BuiltinExecutor, ExecutionError, Executor};

/// Timing knobs for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a leased task stays exclusively ours.
    pub lease_timeout: Duration,
    /// How long one lease call waits for work before reporting none.
    pub block: Duration,
    /// Pause after a failed lease before trying again.
    pub backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
            block: Duration::from_secs(5),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Where a worker is in its cycle. States past `Leasing` carry the lease.
#[derive(Debug)]
pub enum WorkerState {
    Idle,
    Leasing,
    Leased(Lease),
    Executing { lease: Lease, task: Task },
    Publishing { lease: Lease, result: TaskResult },
    Completing(Lease),
    ErrorBackoff,
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Leasing => "leasing",
            WorkerState::Leased(_) => "leased",
            WorkerState::Executing { .. } => "executing",
            WorkerState::Publishing { .. } => "publishing",
            WorkerState::Completing(_) => "completing",
            WorkerState::ErrorBackoff => "error_backoff",
        }
    }
}

/// One language worker. Owns its queue handle and store connection.
pub struct Worker {
    id: Uuid,
    queue: WorkQueue,
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        language: Language,
        executor: Arc<dyn Executor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: WorkQueue::new(Arc::clone(&store), language),
            store,
            executor,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// A worker running the language's built-in computations.
    pub fn builtin(store: Arc<dyn Store>, language: Language, config: WorkerConfig) -> Self {
        Self::new(
            store,
            language,
            Arc::new(BuiltinExecutor::new(language)),
            config,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn language(&self) -> Language {
        self.queue.language()
    }

    /// Token that stops [`Worker::run`] at the next idle point.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shut down. A task already leased is carried through to
    /// completion before the loop exits.
    pub async fn run(&self) {
        info!(worker_id = %self.id, language = %self.language(), "worker started");

        while !self.shutdown.is_cancelled() {
            if let WorkerState::ErrorBackoff = self.run_once().await {
                self.step(WorkerState::ErrorBackoff).await;
            }
        }

        info!(worker_id = %self.id, language = %self.language(), "worker stopped");
    }

    /// One pass from `Leasing` until the worker is `Idle` again or needs to
    /// back off. Returns `Idle` or `ErrorBackoff`; does not sleep.
    pub async fn run_once(&self) -> WorkerState {
        let state = self.step(WorkerState::Leasing).await;
        let WorkerState::Leased(lease) = &state else {
            return state;
        };

        let span = start_task_span(self.language(), lease.id());
        record_state_transition(&span, "leasing", "leased");
        self.drive(state, &span).instrument(span.clone()).await
    }

    async fn drive(&self, mut state: WorkerState, span: &Span) -> WorkerState {
        loop {
            let from = state.name();
            state = self.step(state).await;
            record_state_transition(span, from, state.name());
            if matches!(state, WorkerState::Idle | WorkerState::ErrorBackoff) {
                return state;
            }
        }
    }

    /// Perform the work of `state` and return the next state.
    pub async fn step(&self, state: WorkerState) -> WorkerState {
        match state {
            WorkerState::Idle => WorkerState::Leasing,
            WorkerState::Leasing => self.lease().await,
            WorkerState::Leased(lease) => self.decode(lease),
            WorkerState::Executing { lease, task } => self.execute(lease, task).await,
            WorkerState::Publishing { lease, result } => self.publish(lease, result).await,
            WorkerState::Completing(lease) => self.complete(lease).await,
            WorkerState::ErrorBackoff => {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.backoff) => {}
                    _ = self.shutdown.cancelled() => {}
                }
                WorkerState::Idle
            }
        }
    }

    async fn lease(&self) -> WorkerState {
        match self
            .queue
            .lease(self.config.lease_timeout, self.config.block)
            .await
        {
            Ok(Some(lease)) => WorkerState::Leased(lease),
            Ok(None) => WorkerState::Idle,
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    queue = self.queue.name(),
                    "lease failed, backing off {:?}: {e}",
                    self.config.backoff
                );
                WorkerState::ErrorBackoff
            }
        }
    }

    fn decode(&self, lease: Lease) -> WorkerState {
        match lease.task() {
            Ok(task) => {
                debug!(task_id = %task.task_id, client_id = %task.client_id, "task leased");
                WorkerState::Executing { lease, task }
            }
            Err(e) => {
                // No client id to report to; drop it rather than re-deliver forever.
                error!(task_id = %lease.id(), "discarding undecodable task: {e}");
                WorkerState::Completing(lease)
            }
        }
    }

    async fn execute(&self, lease: Lease, task: Task) -> WorkerState {
        let executor = Arc::clone(&self.executor);
        let payload = task.payload.clone();
        let started = Instant::now();

        let outcome = match tokio::task::spawn_blocking(move || executor.execute(&payload)).await
        {
            Ok(Ok(result)) => Outcome::Success { result },
            Ok(Err(e)) => Outcome::Failure {
                error: e.to_string(),
            },
            Err(join) => Outcome::Failure {
                error: ExecutionError::Aborted(join.to_string()).to_string(),
            },
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let label = match &outcome {
            Outcome::Success { result } => {
                info!(task_id = %task.task_id, result, elapsed_ms, "task executed");
                "success"
            }
            Outcome::Failure { error } => {
                warn!(task_id = %task.task_id, error, elapsed_ms, "task execution failed");
                "failure"
            }
        };
        metrics::tasks_executed().add(
            1,
            &[
                KeyValue::new("language", self.language().as_str()),
                KeyValue::new("outcome", label),
            ],
        );
        metrics::operation_duration_ms()
            .record(elapsed_ms, &[KeyValue::new("operation", "task.execute")]);

        WorkerState::Publishing {
            result: TaskResult::for_task(&task, self.language(), outcome),
            lease,
        }
    }

    async fn publish(&self, lease: Lease, result: TaskResult) -> WorkerState {
        let channel = self.language().result_channel();
        let published = match serde_json::to_string(&result) {
            Ok(body) => self.store.publish(&channel, &body).await,
            Err(e) => Err(e.into()),
        };

        let label = match published {
            Ok(()) => {
                debug!(task_id = %result.task_id, channel, "result published");
                "ok"
            }
            Err(e) => {
                warn!(task_id = %result.task_id, channel, "result notification lost: {e}");
                "error"
            }
        };
        metrics::results_published().add(
            1,
            &[
                KeyValue::new("language", self.language().as_str()),
                KeyValue::new("result", label),
            ],
        );

        WorkerState::Completing(lease)
    }

    async fn complete(&self, lease: Lease) -> WorkerState {
        match self.queue.complete(&lease).await {
            Ok(true) => debug!(task_id = %lease.id(), "task completed"),
            Ok(false) => warn!(
                task_id = %lease.id(),
                "lease expired before completion, task may run again elsewhere"
            ),
            Err(e) => warn!(task_id = %lease.id(), "completion failed, not retrying: {e}"),
        }
        WorkerState::Idle
    }
}
