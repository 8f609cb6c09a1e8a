//! Task results and the events pushed to streaming clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{ClientId, Language, Task, TaskId, TaskPayload};

/// Success value or failure message. Exactly one is ever present on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome {
    Success { result: String },
    Failure { error: String },
}

/// Outcome of running one task. Published once, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub client_id: ClientId,
    /// The task payload, echoed back so clients can correlate without state.
    pub payload: TaskPayload,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub language: Language,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Result for `task`, stamped with the current time.
    pub fn for_task(task: &Task, language: Language, outcome: Outcome) -> Self {
        Self {
            task_id: task.task_id.clone(),
            client_id: task.client_id.clone(),
            payload: task.payload.clone(),
            outcome,
            language,
            completed_at: Utc::now(),
        }
    }

    pub fn result(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { result } => Some(result),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { error } => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Frame sent on liveness ticks. A comment line, ignored by event-stream parsers.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// An event pushed down a client result stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    Result(TaskResult),
}

impl StreamEvent {
    /// Encode as an event-stream `data:` frame.
    pub fn to_frame(&self) -> crate::error::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}
