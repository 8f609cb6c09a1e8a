//! In-process store.
//!
//! Follows the same protocol as the Redis backend: a pending deque per queue,
//! an in-flight map keyed by id with lease deadlines, a broadcast bus for
//! pub/sub. Time comes from `tokio::time`, so tests can pause and advance the
//! clock to drive lease expiry.
//!
//! Clones share state, the way several connections share one server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;

use super::{Claim, Message, QueueDepth, Store, StoredItem, Subscription};
use crate::error::{Error, Result};

const BUS_CAPACITY: usize = 1024;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<StoredItem>,
    leased: HashMap<String, Leased>,
    next_token: u64,
    wake: Arc<Notify>,
}

struct Leased {
    item: StoredItem,
    deadline: Instant,
    token: u64,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.leased.contains_key(id) || self.pending.iter().any(|item| item.id == id)
    }

    /// Put expired leases back at the head, earliest expiry first.
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<(String, Instant)> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, lease)| (id.clone(), lease.deadline))
            .collect();
        expired.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        for (id, _) in expired {
            if let Some(lease) = self.leased.remove(&id) {
                self.pending.push_front(lease.item);
            }
        }
    }

    fn next_expiry(&self, now: Instant) -> Option<Duration> {
        self.leased
            .values()
            .map(|lease| lease.deadline.saturating_duration_since(now))
            .min()
    }
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    bus: broadcast::Sender<Message>,
    live_subscriptions: AtomicUsize,
    unavailable: AtomicBool,
}

/// In-memory [`Store`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                bus,
                live_subscriptions: AtomicUsize::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Number of subscriptions not yet closed or dropped.
    pub fn live_subscriptions(&self) -> usize {
        self.inner.live_subscriptions.load(Ordering::SeqCst)
    }

    /// Simulate an outage: every operation fails with `StoreUnavailable`
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, queue: &str, item: &StoredItem) -> Result<bool> {
        self.check_available()?;
        let mut queues = self.queues();
        let state = queues.entry(queue.to_string()).or_default();
        if state.contains(&item.id) {
            return Ok(false);
        }
        state.pending.push_back(item.clone());
        state.wake.notify_one();
        Ok(true)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Claim> {
        self.check_available()?;
        let now = Instant::now();
        let mut queues = self.queues();
        let state = queues.entry(queue.to_string()).or_default();

        state.reclaim_expired(now);

        match state.pending.pop_front() {
            Some(item) => {
                state.next_token += 1;
                let token = state.next_token;
                state.leased.insert(
                    item.id.clone(),
                    Leased {
                        item: item.clone(),
                        deadline: now + lease,
                        token,
                    },
                );
                Ok(Claim::Leased {
                    item,
                    token,
                    expires_in: lease,
                })
            }
            None => Ok(Claim::Empty {
                next_expiry: state.next_expiry(now),
            }),
        }
    }

    async fn wait_for_push(&self, queue: &str, timeout: Duration) -> Result<()> {
        self.check_available()?;
        let wake = {
            let mut queues = self.queues();
            Arc::clone(&queues.entry(queue.to_string()).or_default().wake)
        };
        let _ = tokio::time::timeout(timeout, wake.notified()).await;
        Ok(())
    }

    async fn remove(&self, queue: &str, id: &str, token: u64) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut queues = self.queues();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };
        match state.leased.get(id) {
            Some(lease) if lease.token == token && lease.deadline > now => {
                state.leased.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        self.check_available()?;
        let queues = self.queues();
        Ok(queues
            .get(queue)
            .map(|state| QueueDepth {
                pending: state.pending.len(),
                in_flight: state.leased.len(),
            })
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.check_available()?;
        // No receivers is not an error: pub/sub drops messages nobody listens to.
        let _ = self.inner.bus.send(Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
        self.check_available()?;
        self.inner.live_subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            rx: self.inner.bus.subscribe(),
            channels: channels.iter().cloned().collect(),
            inner: Arc::clone(&self.inner),
            released: false,
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Message>,
    channels: HashSet<String>,
    inner: Arc<Inner>,
    released: bool,
}

impl MemorySubscription {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.live_subscriptions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.channels.contains(&msg.channel) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory subscription lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}
