//! What a worker runs against a task payload.

use thiserror::Error;

use super::eval;
use crate::model::{Language, TaskPayload};

/// Largest prime-count limit a worker will sieve.
pub const MAX_PRIME_LIMIT: u64 = 50_000_000;

/// The task's own computation failed. Becomes the `error` field of its
/// result; never a worker fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Evaluation(String),

    #[error("{language} workers cannot run {kind} tasks")]
    Unsupported { language: Language, kind: &'static str },

    #[error("limit {0} exceeds the maximum of {MAX_PRIME_LIMIT}")]
    LimitTooLarge(u64),

    #[error("execution aborted: {0}")]
    Aborted(String),
}

/// Language-specific computation. Runs on the blocking pool, so it may burn CPU.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, payload: &TaskPayload) -> Result<String, ExecutionError>;
}

/// The computations every language worker ships with.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinExecutor {
    language: Language,
}

impl BuiltinExecutor {
    pub fn new(language: Language) -> Self {
        Self { language }
    }
}

impl Executor for BuiltinExecutor {
    fn execute(&self, payload: &TaskPayload) -> Result<String, ExecutionError> {
        match (self.language, payload) {
            (_, TaskPayload::Expression { expression }) => eval::evaluate(expression)
                .map(eval::format_number)
                .map_err(ExecutionError::Evaluation),
            (Language::Typescript, TaskPayload::PrimeCount { .. }) => {
                Err(ExecutionError::Unsupported {
                    language: self.language,
                    kind: payload.kind(),
                })
            }
            (Language::Rust | Language::Python, TaskPayload::PrimeCount { limit }) => {
                if *limit > MAX_PRIME_LIMIT {
                    return Err(ExecutionError::LimitTooLarge(*limit));
                }
                Ok(eval::count_primes(*limit).to_string())
            }
        }
    }
}
