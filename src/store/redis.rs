//! Redis store.
//!
//! Every queue mutation is a Lua script, so push, claim and remove are each a
//! single atomic step on the server. Lease deadlines are scored with the
//! server's `TIME`, never the worker's clock.
//!
//! # Key Schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{queue}:pending` | List | Pending ids. Pushed on the left, claimed from the right |
//! | `{queue}:leased` | Sorted Set | In-flight ids scored by lease expiry (epoch ms) |
//! | `{queue}:items` | Hash | id to serialized task body |
//! | `{queue}:ready` | Channel | Published on every push to wake blocked leasers |
//!
//! One background task pattern-subscribes to every `*:ready` channel and fans
//! wakeups out to blocked leasers over a broadcast channel, so concurrent
//! waiters on one store never queue behind each other.

use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::{Claim, Message, QueueDepth, Store, StoredItem, Subscription};
use crate::error::Result;

/// Push unless the id is already known.
///
/// KEYS[1] = items hash, KEYS[2] = pending list.
/// ARGV[1] = id, ARGV[2] = body, ARGV[3] = wake channel.
/// Returns 1 if queued, 0 if the id is already pending or in flight.
const LUA_PUSH: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
redis.call('LPUSH', KEYS[2], ARGV[1])
redis.call('PUBLISH', ARGV[3], ARGV[1])
return 1
"#;

/// Reclaim expired leases onto the head of the pending list, then lease the head.
///
/// KEYS[1] = items hash, KEYS[2] = pending list, KEYS[3] = leased zset.
/// ARGV[1] = lease length in ms.
/// Returns {1, lease_ms, id, body, deadline} when leased, or
/// {0, wait_ms, '', '', 0} when nothing is pending, where wait_ms is the time
/// to the next lease expiry (-1 if nothing is in flight). The deadline doubles
/// as the lease token: a re-lease of the same id always gets a later one.
const LUA_CLAIM: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for i = #expired, 1, -1 do
    redis.call('ZREM', KEYS[3], expired[i])
    redis.call('RPUSH', KEYS[2], expired[i])
end

while true do
    local id = redis.call('RPOP', KEYS[2])
    if not id then
        local head = redis.call('ZRANGE', KEYS[3], 0, 0, 'WITHSCORES')
        if head[2] then
            return {0, tonumber(head[2]) - now, '', '', 0}
        end
        return {0, -1, '', '', 0}
    end
    local body = redis.call('HGET', KEYS[1], id)
    if body then
        local deadline = now + tonumber(ARGV[1])
        redis.call('ZADD', KEYS[3], deadline, id)
        return {1, tonumber(ARGV[1]), id, body, deadline}
    end
end
"#;

/// Remove an in-flight item if this lease of it is still live.
///
/// KEYS[1] = items hash, KEYS[2] = leased zset. ARGV[1] = id, ARGV[2] = token.
/// Returns 1 if removed, 0 if not in flight under the token or already expired.
const LUA_REMOVE: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local deadline = redis.call('ZSCORE', KEYS[2], ARGV[1])
if not deadline or tonumber(deadline) ~= tonumber(ARGV[2]) or tonumber(deadline) <= now then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], ARGV[1])
return 1
"#;

fn items_key(queue: &str) -> String {
    format!("{queue}:items")
}

fn pending_key(queue: &str) -> String {
    format!("{queue}:pending")
}

fn leased_key(queue: &str) -> String {
    format!("{queue}:leased")
}

fn ready_channel(queue: &str) -> String {
    format!("{queue}:ready")
}

const READY_PATTERN: &str = "*:ready";
const READY_BUFFER: usize = 256;

/// Redis-backed [`Store`].
///
/// Holds one multiplexed connection for commands, plus one pub/sub
/// connection owned by the wake reader. Every [`Store::subscribe`] call opens
/// its own connection.
pub struct RedisStore {
    client: ::redis::Client,
    conn: MultiplexedConnection,
    ready: broadcast::Sender<String>,
    reader: JoinHandle<()>,
}

impl RedisStore {
    /// Connect to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    pub async fn connect(url: &SecretString) -> Result<Self> {
        let client = ::redis::Client::open(url.expose_secret())?;
        let conn = client.get_multiplexed_async_connection().await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(READY_PATTERN).await?;
        let (ready, _) = broadcast::channel(READY_BUFFER);
        let reader = tokio::spawn(read_wakeups(pubsub, ready.clone()));

        Ok(Self {
            client,
            conn,
            ready,
            reader,
        })
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Forward the queue name of every `<queue>:ready` message to `ready`.
async fn read_wakeups(pubsub: PubSub, ready: broadcast::Sender<String>) {
    let mut messages = pubsub.into_on_message();
    while let Some(msg) = messages.next().await {
        if let Some(queue) = msg.get_channel_name().strip_suffix(":ready") {
            // No receivers just means nobody is blocked right now.
            let _ = ready.send(queue.to_string());
        }
    }
    tracing::warn!("redis wake connection closed; blocking leases fall back to timeouts");
}

#[async_trait]
impl Store for RedisStore {
    async fn push(&self, queue: &str, item: &StoredItem) -> Result<bool> {
        let queued: i64 = Script::new(LUA_PUSH)
            .key(items_key(queue))
            .key(pending_key(queue))
            .arg(&item.id)
            .arg(&item.data)
            .arg(ready_channel(queue))
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(queued == 1)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Claim> {
        let lease_ms = lease.as_millis().max(1) as u64;
        let (leased, ms, id, data, token): (i64, i64, String, String, i64) =
            Script::new(LUA_CLAIM)
                .key(items_key(queue))
                .key(pending_key(queue))
                .key(leased_key(queue))
                .arg(lease_ms)
                .invoke_async(&mut self.conn.clone())
                .await?;

        if leased == 1 {
            return Ok(Claim::Leased {
                item: StoredItem { id, data },
                token: token.max(0) as u64,
                expires_in: Duration::from_millis(ms.max(0) as u64),
            });
        }
        Ok(Claim::Empty {
            next_expiry: (ms >= 0).then(|| Duration::from_millis(ms as u64)),
        })
    }

    async fn wait_for_push(&self, queue: &str, timeout: Duration) -> Result<()> {
        let mut ready = self.ready.subscribe();
        let woken = async {
            loop {
                match ready.recv().await {
                    Ok(name) if name == queue => return,
                    Ok(_) => continue,
                    // Missed wakeups may include ours; let the caller re-claim.
                    Err(RecvError::Lagged(_)) => return,
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };
        let _ = tokio::time::timeout(timeout, woken).await;
        Ok(())
    }

    async fn remove(&self, queue: &str, id: &str, token: u64) -> Result<bool> {
        let removed: i64 = Script::new(LUA_REMOVE)
            .key(items_key(queue))
            .key(leased_key(queue))
            .arg(id)
            .arg(token)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(removed == 1)
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let mut conn = self.conn.clone();
        let pending: usize = conn.llen(pending_key(queue)).await?;
        let in_flight: usize = conn.zcard(leased_key(queue)).await?;
        Ok(QueueDepth { pending, in_flight })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        Ok(Box::new(RedisSubscription {
            pubsub,
            channels: channels.to_vec(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

struct RedisSubscription {
    pubsub: PubSub,
    channels: Vec<String>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Option<Message> {
        let mut messages = std::pin::pin!(self.pubsub.on_message());
        loop {
            let msg = messages.next().await?;
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    return Some(Message {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        channel = msg.get_channel_name(),
                        "undecodable pub/sub payload: {e}"
                    );
                }
            }
        }
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let channels = std::mem::take(&mut self.channels);
        for channel in &channels {
            self.pubsub.unsubscribe(channel).await?;
        }
        // Dropping the PubSub closes its dedicated connection.
        Ok(())
    }
}
