//! Tasks, their identifiers, payload kinds and the languages that run them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Caller-supplied task identifier, unique per task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

/// Identifier of the client that submitted a task and waits for its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

/// A worker pool. Each language owns one queue and one result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Typescript,
    Python,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Rust, Language::Typescript, Language::Python];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Typescript => "typescript",
            Language::Python => "python",
        }
    }

    /// Key prefix of this language's work queue.
    pub fn queue_name(self) -> String {
        format!("{}_jobs", self.as_str())
    }

    /// Pub/sub channel this language's workers publish results on.
    pub fn result_channel(self) -> String {
        format!("results:{}", self.as_str())
    }

    /// Result channels of every language. Stream sessions subscribe to all of them.
    pub fn all_result_channels() -> Vec<String> {
        Self::ALL.iter().map(|l| l.result_channel()).collect()
    }

    /// Whether this language's workers know how to run the payload kind.
    pub fn accepts(self, payload: &TaskPayload) -> bool {
        match (self, payload) {
            (_, TaskPayload::Expression { .. }) => true,
            (Language::Rust | Language::Python, TaskPayload::PrimeCount { .. }) => true,
            (Language::Typescript, TaskPayload::PrimeCount { .. }) => false,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rust" => Ok(Language::Rust),
            "typescript" => Ok(Language::Typescript),
            "python" => Ok(Language::Python),
            other => Err(format!(
                "unknown language {other:?}, must be rust, typescript, or python"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What to compute. The wire shape decides the kind: `{"expression": "2+2"}`
/// or `{"limit": 1000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPayload {
    /// Arithmetic expression to evaluate.
    Expression { expression: String },
    /// Count the primes less than or equal to `limit`.
    PrimeCount { limit: u64 },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Expression { .. } => "expression",
            TaskPayload::PrimeCount { .. } => "prime_count",
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work as it sits in a language queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub client_id: ClientId,
    pub language: Language,
    pub payload: TaskPayload,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Build a task stamped with the current time.
    pub fn new(
        task_id: impl Into<String>,
        client_id: impl Into<String>,
        language: Language,
        payload: TaskPayload,
    ) -> Self {
        Self {
            task_id: TaskId(task_id.into()),
            client_id: ClientId(client_id.into()),
            language,
            payload,
            created_at: Utc::now(),
        }
    }
}
