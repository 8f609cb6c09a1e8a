//! Integration tests for telemetry initialization and span helpers.

use taskq::model::{Language, TaskId};
use taskq::telemetry::task::{record_state_transition, start_task_span};
use taskq::telemetry::{TelemetryConfig, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process; a second
    // attempt returning Err is acceptable.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "taskq-test".to_string(),
        default_filter: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn task_span_records_state_transitions() {
    let span = start_task_span(Language::Python, &TaskId::from("t1"));
    record_state_transition(&span, "leased", "executing");
    record_state_transition(&span, "executing", "publishing");
}

#[test]
fn metric_instruments_are_usable_without_exporter() {
    use opentelemetry::KeyValue;

    metrics::tasks_submitted().add(1, &[KeyValue::new("result", "ok")]);
    metrics::queue_operations().add(1, &[KeyValue::new("operation", "lease")]);
    metrics::stream_sessions().add(1, &[KeyValue::new("event", "opened")]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "test")]);
}
