//! Task submission boundary: validate a request, then enqueue exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Language, Task, TaskPayload};
use crate::queue::WorkQueue;
use crate::store::Store;
use crate::telemetry::metrics;

/// Longest expression accepted at submission, in bytes.
pub const MAX_EXPRESSION_LEN: usize = 4096;

/// An inbound submission, as received. Every field is optional here so that
/// validation, not deserialization, decides what is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub task_id: Option<String>,
    pub client_id: Option<String>,
    pub language: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// Older clients send the expression at the top level instead of a payload.
    pub expression: Option<String>,
}

/// Retry policy for enqueueing against a flaky store.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Total enqueue attempts per submission, including the first.
    pub enqueue_attempts: u32,
    /// Pause between attempts; doubles after each failure.
    pub retry_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enqueue_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Validates submissions and routes them to the matching language queue.
pub struct Dispatcher {
    queues: HashMap<Language, WorkQueue>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, config: DispatchConfig) -> Self {
        let queues = Language::ALL
            .iter()
            .map(|&language| (language, WorkQueue::new(Arc::clone(&store), language)))
            .collect();
        Self { queues, config }
    }

    pub fn queue(&self, language: Language) -> Option<&WorkQueue> {
        self.queues.get(&language)
    }

    /// Check `request` against the submission schema and build the task,
    /// stamped with the current time. No side effects.
    pub fn validate(request: &SubmitRequest) -> Result<Task> {
        let task_id = required("taskId", request.task_id.as_deref())?;
        let client_id = required("clientId", request.client_id.as_deref())?;
        let language: Language = required("language", request.language.as_deref())?
            .parse()
            .map_err(|reason: String| Error::validation("language", reason))?;

        let payload = match (&request.payload, &request.expression) {
            (Some(value), _) => serde_json::from_value::<TaskPayload>(value.clone()).map_err(|_| {
                Error::validation(
                    "payload",
                    "expected {\"expression\": string} or {\"limit\": non-negative integer}",
                )
            })?,
            (None, Some(expression)) => TaskPayload::Expression {
                expression: expression.clone(),
            },
            (None, None) => return Err(Error::validation("payload", "is required")),
        };

        if let TaskPayload::Expression { expression } = &payload {
            if expression.trim().is_empty() {
                return Err(Error::validation("payload", "expression must not be empty"));
            }
            if expression.len() > MAX_EXPRESSION_LEN {
                return Err(Error::validation(
                    "payload",
                    format!("expression longer than {MAX_EXPRESSION_LEN} bytes"),
                ));
            }
        }
        if !language.accepts(&payload) {
            return Err(Error::validation(
                "payload",
                format!("{language} workers do not accept {} tasks", payload.kind()),
            ));
        }

        Ok(Task::new(task_id, client_id, language, payload))
    }

    /// Validate and enqueue. On success the task is owned by its queue.
    ///
    /// `StoreUnavailable` is retried per [`DispatchConfig`]; if every attempt
    /// fails, the task was not accepted.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Task> {
        let task = match Self::validate(&request) {
            Ok(task) => task,
            Err(e) => {
                record_submission(language_label(request.language.as_deref()), "invalid");
                return Err(e);
            }
        };

        let queue = self
            .queues
            .get(&task.language)
            .ok_or_else(|| Error::Other(format!("no queue for {}", task.language)))?;

        let result = self.enqueue_with_retry(queue, &task).await;
        let label = match &result {
            Ok(()) => "ok",
            Err(Error::DuplicateTask(_)) => "duplicate",
            Err(_) => "error",
        };
        record_submission(task.language.as_str(), label);
        result?;

        tracing::info!(
            task_id = %task.task_id,
            client_id = %task.client_id,
            language = %task.language,
            kind = task.payload.kind(),
            "task submitted"
        );
        Ok(task)
    }

    async fn enqueue_with_retry(&self, queue: &WorkQueue, task: &Task) -> Result<()> {
        let attempts = self.config.enqueue_attempts.max(1);
        let mut backoff = self.config.retry_backoff;

        for attempt in 1..=attempts {
            match queue.enqueue(task).await {
                Ok(()) => return Ok(()),
                // An earlier attempt may have landed before its reply was lost.
                Err(Error::DuplicateTask(_)) if attempt > 1 => {
                    tracing::debug!(task_id = %task.task_id, "retried enqueue found task already queued");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        task_id = %task.task_id,
                        attempt,
                        "enqueue failed, retrying in {backoff:?}: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::StoreUnavailable(format!(
            "enqueue of {} failed after {attempts} attempts",
            task.task_id
        )))
    }
}

fn required<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim()),
        _ => Err(Error::validation(field, "is required")),
    }
}

/// Metric label for a submitted language: a known name, or `unknown`.
fn language_label(language: Option<&str>) -> &'static str {
    language
        .and_then(|l| l.trim().parse::<Language>().ok())
        .map_or("unknown", Language::as_str)
}

fn record_submission(language: &'static str, result: &'static str) {
    metrics::tasks_submitted().add(
        1,
        &[
            KeyValue::new("language", language),
            KeyValue::new("result", result),
        ],
    );
}
