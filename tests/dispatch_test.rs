//! Integration tests for submission validation and enqueue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use taskq::dispatch::{DispatchConfig, Dispatcher, MAX_EXPRESSION_LEN, SubmitRequest};
use taskq::error::{Error, Result};
use taskq::model::{Language, TaskPayload};
use taskq::store::{Claim, MemoryStore, QueueDepth, Store, StoredItem, Subscription};

fn request(language: &str, payload: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        task_id: Some("task-1".to_string()),
        client_id: Some("client-1".to_string()),
        language: Some(language.to_string()),
        payload: Some(payload),
        expression: None,
    }
}

fn dispatcher(store: &MemoryStore) -> Dispatcher {
    Dispatcher::new(Arc::new(store.clone()), DispatchConfig::default())
}

async fn total_pending(store: &MemoryStore) -> usize {
    let mut total = 0;
    for language in Language::ALL {
        total += store.depth(&language.queue_name()).await.unwrap().pending;
    }
    total
}

fn invalid_field(err: &Error) -> Option<&'static str> {
    match err {
        Error::Validation { field, .. } => Some(*field),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn valid_submission_is_enqueued_on_its_language_queue() {
    let store = MemoryStore::new();
    let task = dispatcher(&store)
        .submit(request("python", json!({"expression": "2+2"})))
        .await
        .unwrap();

    assert_eq!(task.task_id.0, "task-1");
    assert_eq!(task.language, Language::Python);
    assert_eq!(store.depth("python_jobs").await.unwrap().pending, 1);
    assert_eq!(store.depth("rust_jobs").await.unwrap().pending, 0);
}

#[tokio::test]
async fn missing_client_id_is_rejected_and_nothing_is_enqueued() {
    let store = MemoryStore::new();
    let mut req = request("rust", json!({"expression": "2+2"}));
    req.client_id = None;

    let err = dispatcher(&store).submit(req).await.unwrap_err();
    assert_eq!(invalid_field(&err), Some("clientId"));
    assert_eq!(total_pending(&store).await, 0);
}

#[test]
fn each_required_field_is_checked() {
    let base = request("rust", json!({"expression": "2+2"}));

    let mut req = base.clone();
    req.task_id = Some(String::new());
    assert_eq!(invalid_field(&Dispatcher::validate(&req).unwrap_err()), Some("taskId"));

    let mut req = base.clone();
    req.language = None;
    assert_eq!(invalid_field(&Dispatcher::validate(&req).unwrap_err()), Some("language"));

    let mut req = base.clone();
    req.payload = None;
    assert_eq!(invalid_field(&Dispatcher::validate(&req).unwrap_err()), Some("payload"));

    assert!(Dispatcher::validate(&base).is_ok());
}

#[test]
fn unknown_language_is_rejected() {
    let err = Dispatcher::validate(&request("cobol", json!({"expression": "1"}))).unwrap_err();
    assert_eq!(invalid_field(&err), Some("language"));
}

#[test]
fn malformed_or_empty_payload_is_rejected() {
    for payload in [
        json!({"expression": ""}),
        json!({"expression": 42}),
        json!({"limit": -1}),
        json!({"something": "else"}),
        json!("2+2"),
    ] {
        let err = Dispatcher::validate(&request("rust", payload.clone())).unwrap_err();
        assert_eq!(invalid_field(&err), Some("payload"), "payload {payload}");
    }
}

#[test]
fn overlong_expression_is_rejected() {
    let expression = "1+".repeat(MAX_EXPRESSION_LEN) + "1";
    let err = Dispatcher::validate(&request("rust", json!({ "expression": expression }))).unwrap_err();
    assert_eq!(invalid_field(&err), Some("payload"));
}

#[test]
fn identifiers_are_stored_trimmed() {
    let mut req = request(" rust ", json!({"expression": "1+1"}));
    req.task_id = Some(" task-1 ".to_string());
    req.client_id = Some(" c1".to_string());

    let task = Dispatcher::validate(&req).unwrap();
    assert_eq!(task.task_id.0, "task-1");
    assert_eq!(task.client_id.0, "c1");
    assert_eq!(task.language, Language::Rust);
}

#[test]
fn typescript_does_not_accept_prime_counting() {
    let err = Dispatcher::validate(&request("typescript", json!({"limit": 100}))).unwrap_err();
    assert_eq!(invalid_field(&err), Some("payload"));

    let task = Dispatcher::validate(&request("rust", json!({"limit": 100}))).unwrap();
    assert_eq!(task.payload, TaskPayload::PrimeCount { limit: 100 });
}

#[test]
fn legacy_top_level_expression_is_accepted() {
    let req = SubmitRequest {
        task_id: Some("t".to_string()),
        client_id: Some("c".to_string()),
        language: Some("typescript".to_string()),
        payload: None,
        expression: Some("3*3".to_string()),
    };
    let task = Dispatcher::validate(&req).unwrap();
    assert_eq!(
        task.payload,
        TaskPayload::Expression {
            expression: "3*3".to_string()
        }
    );
}

#[test]
fn submission_deserializes_from_camel_case_json() {
    let req: SubmitRequest = serde_json::from_value(json!({
        "taskId": "t",
        "clientId": "c",
        "language": "rust",
        "payload": {"expression": "1+1"}
    }))
    .unwrap();
    let task = Dispatcher::validate(&req).unwrap();
    assert_eq!(task.client_id.0, "c");
}

// ---------------------------------------------------------------------------
// Enqueue failures and retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_task_id_is_rejected() {
    let store = MemoryStore::new();
    let d = dispatcher(&store);
    d.submit(request("rust", json!({"expression": "1"}))).await.unwrap();

    let err = d
        .submit(request("rust", json!({"expression": "1"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateTask(_)));
    assert_eq!(store.depth("rust_jobs").await.unwrap().pending, 1);
}

#[tokio::test(start_paused = true)]
async fn store_outage_fails_after_all_attempts() {
    let store = MemoryStore::new();
    store.set_unavailable(true);

    let err = dispatcher(&store)
        .submit(request("rust", json!({"expression": "1"})))
        .await
        .unwrap_err();
    assert!(err.is_transient());

    store.set_unavailable(false);
    assert_eq!(total_pending(&store).await, 0);
}

/// Fails the first `failures` pushes, accepting the write on the store but
/// reporting an error, as a lost reply would.
struct LostReply {
    inner: MemoryStore,
    failures: AtomicUsize,
}

#[async_trait]
impl Store for LostReply {
    async fn push(&self, queue: &str, item: &StoredItem) -> Result<bool> {
        let queued = self.inner.push(queue, item).await?;
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::StoreUnavailable("connection reset".to_string()));
        }
        Ok(queued)
    }
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Claim> {
        self.inner.claim(queue, lease).await
    }
    async fn wait_for_push(&self, queue: &str, timeout: Duration) -> Result<()> {
        self.inner.wait_for_push(queue, timeout).await
    }
    async fn remove(&self, queue: &str, id: &str, token: u64) -> Result<bool> {
        self.inner.remove(queue, id, token).await
    }
    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        self.inner.depth(queue).await
    }
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.inner.publish(channel, payload).await
    }
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
        self.inner.subscribe(channels).await
    }
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

#[tokio::test(start_paused = true)]
async fn retry_after_lost_reply_does_not_duplicate_the_task() {
    let store = MemoryStore::new();
    let lossy = LostReply {
        inner: store.clone(),
        failures: AtomicUsize::new(1),
    };
    let d = Dispatcher::new(Arc::new(lossy), DispatchConfig::default());

    let task = d
        .submit(request("rust", json!({"expression": "1+1"})))
        .await
        .unwrap();
    assert_eq!(task.task_id.0, "task-1");
    assert_eq!(store.depth("rust_jobs").await.unwrap().pending, 1);
}
