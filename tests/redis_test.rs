//! Redis store tests. Need a running Redis:
//!
//! ```sh
//! REDIS_URL=redis://localhost:6379 cargo test --test redis_test -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use taskq::model::{Language, Task, TaskPayload};
use taskq::queue::WorkQueue;
use taskq::store::{RedisStore, Store};
use taskq::stream::{ClientStreamSession, SessionEnd, StreamConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn store() -> Arc<RedisStore> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    Arc::new(
        RedisStore::connect(&SecretString::from(url))
            .await
            .expect("failed to connect to Redis"),
    )
}

/// Queue names are fixed per language, so each run drains the python queue
/// first and tags its task ids with a fresh prefix.
fn python_queue(store: Arc<RedisStore>) -> (WorkQueue, String) {
    let prefix = uuid::Uuid::new_v4().to_string();
    (WorkQueue::new(store, Language::Python), prefix)
}

async fn drain(queue: &WorkQueue) {
    while let Some(lease) = queue.lease(Duration::from_secs(5), Duration::ZERO).await.unwrap() {
        queue.complete(&lease).await.unwrap();
    }
}

fn task(id: &str) -> Task {
    Task::new(
        id,
        "redis-test",
        Language::Python,
        TaskPayload::Expression {
            expression: "1+1".to_string(),
        },
    )
}

#[tokio::test]
#[ignore]
async fn ping_succeeds() {
    store().await.ping().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn lease_complete_and_redelivery_against_redis() {
    let store = store().await;
    let (queue, prefix) = python_queue(Arc::clone(&store));
    drain(&queue).await;

    let id = format!("{prefix}-a");
    queue.enqueue(&task(&id)).await.unwrap();
    assert!(matches!(
        queue.enqueue(&task(&id)).await,
        Err(taskq::Error::DuplicateTask(_))
    ));

    let first = queue
        .lease(Duration::from_millis(300), Duration::ZERO)
        .await
        .unwrap()
        .expect("leased");
    assert_eq!(first.id().0, id);
    assert!(queue.lease(Duration::from_secs(5), Duration::ZERO).await.unwrap().is_none());

    // Blocks until the short lease lapses.
    let second = queue
        .lease(Duration::from_secs(5), Duration::from_secs(2))
        .await
        .unwrap()
        .expect("redelivered");
    assert_eq!(second.id(), first.id());

    assert!(!queue.complete(&first).await.unwrap());
    assert!(queue.complete(&second).await.unwrap());
    assert!(queue.lease(Duration::from_secs(5), Duration::ZERO).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn blocking_lease_wakes_on_push() {
    let store = store().await;
    let (queue, prefix) = python_queue(Arc::clone(&store));
    drain(&queue).await;

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.lease(Duration::from_secs(5), Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.enqueue(&task(&format!("{prefix}-late"))).await.unwrap();

    let lease = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("woken by push")
        .unwrap()
        .unwrap()
        .unwrap();
    queue.complete(&lease).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn concurrent_blocked_leases_share_one_store() {
    let store = store().await;
    let (queue, prefix) = python_queue(Arc::clone(&store));
    drain(&queue).await;

    let block = Duration::from_secs(1);
    let started = tokio::time::Instant::now();
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease(Duration::from_secs(5), block).await })
        })
        .collect();
    for waiter in waiters {
        assert!(waiter.await.unwrap().unwrap().is_none());
    }
    // Each caller waits out its own interval, not the other's as well.
    assert!(started.elapsed() < block + Duration::from_millis(700));

    // A push reaches whichever caller is blocked; exactly one leases it.
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease(Duration::from_secs(5), Duration::from_secs(5)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.enqueue(&task(&format!("{prefix}-shared"))).await.unwrap();

    let mut leased = Vec::new();
    for waiter in waiters {
        if let Ok(joined) = tokio::time::timeout(Duration::from_secs(2), waiter).await {
            leased.extend(joined.unwrap().unwrap());
        }
    }
    assert_eq!(leased.len(), 1);
    assert!(queue.complete(&leased[0]).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn session_receives_own_results_and_unsubscribes() {
    let store = store().await;
    let client = uuid::Uuid::new_v4().to_string();

    let session = ClientStreamSession::open(store.as_ref(), Some(&client), &StreamConfig::default())
        .await
        .unwrap();
    let (mut tx, mut rx) = mpsc::channel::<String>(8);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { session.run(&mut tx, token).await });

    let connected = rx.recv().await.unwrap();
    assert!(connected.contains("connected"));

    let result = serde_json::json!({
        "taskId": "t1",
        "clientId": client,
        "payload": {"expression": "1+1"},
        "result": "2",
        "language": "python",
        "timestamp": 0
    });
    store
        .publish(&Language::Python.result_channel(), &result.to_string())
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(frame.contains("\"taskId\":\"t1\""));

    cancel.cancel();
    assert_eq!(handle.await.unwrap(), SessionEnd::Cancelled);
}
