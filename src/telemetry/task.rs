//! Task execution span helpers.

use tracing::Span;

use crate::model::{Language, TaskId};

/// Start a span covering one leased task, from lease to completion.
///
/// `task.state` is declared empty and updated by
/// [`record_state_transition`].
pub fn start_task_span(language: Language, task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.process",
        "task.language" = %language,
        "task.id" = %task_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a worker state transition on `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::debug!(from, to, "state_transition");
    });
}
