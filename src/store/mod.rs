//! Backing store primitives.
//!
//! The work queue and the result router only ever talk to the store through
//! [`Store`]: atomic push, atomic claim-with-expiry, atomic remove-if-leased,
//! publish, and subscribe. Lease expiry lives in the store's own clock, so a
//! crashed worker cannot hold a task past its timeout.
//!
//! Two backends ship with the crate: [`redis::RedisStore`] for real
//! deployments and [`memory::MemoryStore`] for tests and single-process runs.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// An opaque queued item: the task id and its serialized body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub id: String,
    pub data: String,
}

/// Outcome of a single atomic claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The item is now in flight until `expires_in` elapses on the store clock.
    /// `token` identifies this particular lease of the item.
    Leased {
        item: StoredItem,
        token: u64,
        expires_in: Duration,
    },
    /// Nothing pending. `next_expiry` is how long until the earliest live
    /// lease lapses and its item becomes claimable again.
    Empty { next_expiry: Option<Duration> },
}

/// Pending and in-flight counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: usize,
    pub in_flight: usize,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

/// A live channel subscription on a connection dedicated to it.
///
/// [`Subscription::close`] unsubscribes and releases the connection. Dropping
/// without closing still releases the connection, just without the
/// unsubscribe round trip.
#[async_trait]
pub trait Subscription: Send {
    /// Next message on any subscribed channel. `None` once the connection is gone.
    async fn next_message(&mut self) -> Option<Message>;

    /// Unsubscribe from every channel and release the connection.
    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Append an item to the tail of `queue`. Returns false, and changes
    /// nothing, if an item with the same id is already pending or in flight.
    async fn push(&self, queue: &str, item: &StoredItem) -> Result<bool>;

    /// Atomically return expired leases to the front of `queue`, then move
    /// the head into flight with an expiry of `lease` from now.
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Claim>;

    /// Wait up to `timeout` for a push to `queue`. Returning early is only a
    /// hint; callers must claim again to find out.
    async fn wait_for_push(&self, queue: &str, timeout: Duration) -> Result<()>;

    /// Remove an in-flight item for good. Returns false if it is not in
    /// flight under `token`, or that lease has already expired.
    async fn remove(&self, queue: &str, id: &str, token: u64) -> Result<bool>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth>;

    /// Fire-and-forget publish. Subscribers that are not connected miss it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channels` on a fresh connection.
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>>;

    async fn ping(&self) -> Result<()>;
}
