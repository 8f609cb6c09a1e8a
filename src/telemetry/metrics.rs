//! Metric instruments.
//!
//! Built from the globally registered `MeterProvider`, so they are no-ops
//! until [`init_telemetry`](super::init_telemetry) installs an exporter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: task submissions at the dispatcher.
/// Labels: `language`, `result` ("ok" | "invalid" | "duplicate" | "error").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.submitted")
        .with_description("Number of task submissions")
        .build()
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation` ("send" | "send_rejected" | "lease" |
/// "lease_empty" | "complete" | "complete_expired").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: tasks executed by workers.
/// Labels: `language`, `outcome` ("success" | "failure").
pub fn tasks_executed() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.executed")
        .with_description("Number of tasks executed")
        .build()
}

/// Counter: result publications.
/// Labels: `language`, `result` ("ok" | "error").
pub fn results_published() -> Counter<u64> {
    meter()
        .u64_counter("taskq.results.published")
        .with_description("Number of task results published")
        .build()
}

/// Counter: stream session lifecycle.
/// Labels: `event` ("opened" | "closed").
pub fn stream_sessions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.stream.sessions")
        .with_description("Client stream sessions opened and closed")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
