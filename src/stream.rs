//! Client result streams.
//!
//! A [`ClientStreamSession`] subscribes to every language's result channel,
//! forwards only the results addressed to its client, and sends a heartbeat
//! on a fixed interval. Its subscription is released on every exit path.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::model::{ClientId, HEARTBEAT_FRAME, Language, StreamEvent, TaskResult};
use crate::store::{Message, Store, Subscription};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Gap between heartbeats on an otherwise quiet stream.
    pub heartbeat_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// The receiving end of a stream is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream sink closed")]
pub struct SinkClosed;

/// Where session frames go. The transport behind it is not the session's concern.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_frame(&mut self, frame: String) -> std::result::Result<(), SinkClosed>;

    /// Resolves once the receiver has gone away.
    async fn closed(&self);
}

#[async_trait]
impl EventSink for mpsc::Sender<String> {
    async fn send_frame(&mut self, frame: String) -> std::result::Result<(), SinkClosed> {
        self.send(frame).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server cancelled the session.
    Cancelled,
    /// A frame could not be delivered, or the client disconnected.
    ClientGone,
    /// The store dropped the subscription.
    SubscriptionClosed,
}

enum Next {
    Cancelled,
    ClientGone,
    Heartbeat,
    Message(Option<Message>),
}

pub struct ClientStreamSession {
    client_id: ClientId,
    subscription: Option<Box<dyn Subscription>>,
    heartbeat_interval: Duration,
}

impl std::fmt::Debug for ClientStreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStreamSession")
            .field("client_id", &self.client_id)
            .field("subscribed", &self.subscription.is_some())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

impl ClientStreamSession {
    /// Open a session for `client_id`, subscribing to all result channels.
    ///
    /// Fails with [`Error::MissingClientId`] before touching the store when
    /// the id is absent or blank.
    pub async fn open(
        store: &dyn Store,
        client_id: Option<&str>,
        config: &StreamConfig,
    ) -> Result<Self> {
        let client_id = match client_id.map(str::trim) {
            Some(id) if !id.is_empty() => ClientId::from(id),
            _ => return Err(Error::MissingClientId),
        };

        let subscription = store.subscribe(&Language::all_result_channels()).await?;
        metrics::stream_sessions().add(1, &[KeyValue::new("event", "opened")]);
        info!(client_id = %client_id, "result stream opened");

        Ok(Self {
            client_id,
            subscription: Some(subscription),
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Forward this client's results to `sink` until `cancel` fires, the
    /// client goes away, or the store drops the subscription. Always tears
    /// the subscription down before returning.
    pub async fn run<S: EventSink>(mut self, sink: &mut S, cancel: CancellationToken) -> SessionEnd {
        let end = self.forward(sink, &cancel).await;
        self.close().await;
        info!(client_id = %self.client_id, reason = ?end, "result stream closed");
        end
    }

    async fn forward<S: EventSink>(&mut self, sink: &mut S, cancel: &CancellationToken) -> SessionEnd {
        let connected = StreamEvent::Connected {
            client_id: self.client_id.clone(),
        };
        match connected.to_frame() {
            Ok(frame) => {
                if sink.send_frame(frame).await.is_err() {
                    return SessionEnd::ClientGone;
                }
            }
            Err(e) => warn!(client_id = %self.client_id, "failed to encode connected event: {e}"),
        }

        let Some(subscription) = self.subscription.as_mut() else {
            return SessionEnd::SubscriptionClosed;
        };

        let period = self.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Next::Cancelled,
                _ = sink.closed() => Next::ClientGone,
                _ = heartbeat.tick() => Next::Heartbeat,
                message = subscription.next_message() => Next::Message(message),
            };

            let frame = match next {
                Next::Cancelled => return SessionEnd::Cancelled,
                Next::ClientGone => return SessionEnd::ClientGone,
                Next::Message(None) => return SessionEnd::SubscriptionClosed,
                Next::Heartbeat => HEARTBEAT_FRAME.to_string(),
                Next::Message(Some(message)) => {
                    match route(&self.client_id, &message) {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
            };

            if sink.send_frame(frame).await.is_err() {
                return SessionEnd::ClientGone;
            }
        }
    }

    /// Unsubscribe and release the store connection. Safe to call twice.
    pub async fn close(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        if let Err(e) = subscription.close().await {
            // The subscription's connection is dropped regardless.
            warn!(client_id = %self.client_id, "unsubscribe failed: {e}");
        }
        metrics::stream_sessions().add(1, &[KeyValue::new("event", "closed")]);
    }
}

/// Frame for `message` if it is a result addressed to `client_id`.
fn route(client_id: &ClientId, message: &Message) -> Option<String> {
    let result: TaskResult = match serde_json::from_str(&message.payload) {
        Ok(result) => result,
        Err(e) => {
            warn!(channel = message.channel, "dropping undecodable result: {e}");
            return None;
        }
    };

    if &result.client_id != client_id {
        trace!(task_id = %result.task_id, "result for another client");
        return None;
    }

    debug!(task_id = %result.task_id, client_id = %client_id, "forwarding result");
    match StreamEvent::Result(result).to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(client_id = %client_id, "failed to encode result event: {e}");
            None
        }
    }
}
