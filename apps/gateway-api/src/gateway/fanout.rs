//! Cross-process fanout transport.
//!
//! Publishes are fire-and-forget and best-effort: anything published while
//! the broker is unreachable is dropped, never queued. Ordering is FIFO per
//! topic per publisher and nothing more. Subscriptions are unsubscribed by
//! being dropped.
//!
//! Two implementations: [`LocalBus`] (a `tokio::sync::broadcast` loopback
//! for single-process deployments and tests, where several routers can share
//! one bus to simulate a cluster) and [`RedisBus`] (redis pub/sub with
//! pattern subscriptions and capped exponential backoff reconnect).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::GatewayError;

const LOCAL_BUS_CAPACITY: usize = 4096;

/// One message observed on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

/// A live subscription. Dropping it unsubscribes.
pub struct BusSubscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    filter_task: Option<JoinHandle<()>>,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.filter_task.take() {
            task.abort();
        }
    }
}

/// The cross-process publish/subscribe transport.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Fire-and-forget publish. An error means the broker was unreachable
    /// and the message is gone; callers decide whether to fall back to
    /// local-only delivery.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), GatewayError>;

    /// Subscribe to a redis-glob style topic pattern (`room.*`, `broadcast`).
    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, GatewayError>;

    /// Bumped once per successful (re)connect of the subscriber transport.
    /// Presence uses this to re-broadcast local counts after an outage.
    fn reconnects(&self) -> watch::Receiver<u64>;
}

/// `*` matches any suffix within the pattern position; otherwise exact.
/// Mirrors the subset of redis glob syntax this system uses.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            topic.len() >= prefix.len() + suffix.len()
                && topic.starts_with(prefix)
                && topic.ends_with(suffix)
        }
        None => pattern == topic,
    }
}

// ---------------------------------------------------------------------------
// In-memory bus
// ---------------------------------------------------------------------------

/// Single-process loopback bus. The publisher's own process receives its
/// messages, so local delivery flows through the same path as remote.
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
    reconnects: watch::Sender<u64>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        let (reconnects, _) = watch::channel(0);
        Self { sender, reconnects }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), GatewayError> {
        // send() errs only when nobody subscribes — that's fine.
        let _ = self.sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, GatewayError> {
        let mut source = self.sender.subscribe();
        let (tx, receiver) = mpsc::unbounded_channel();
        let pattern = pattern.to_string();

        let filter_task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if topic_matches(&pattern, &message.topic) && tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%pattern, skipped, "bus subscriber lagged, dropping");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(BusSubscription {
            receiver,
            filter_task: Some(filter_task),
        })
    }

    fn reconnects(&self) -> watch::Receiver<u64> {
        self.reconnects.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Redis bus
// ---------------------------------------------------------------------------

type PatternSinks = Arc<DashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>;

/// Redis pub/sub transport. Publishing goes through a `ConnectionManager`
/// (which reconnects on its own); the subscriber side runs a dedicated task
/// that re-`PSUBSCRIBE`s with capped exponential backoff whenever the
/// connection drops.
pub struct RedisBus {
    manager: redis::aio::ConnectionManager,
    sinks: PatternSinks,
    new_patterns: mpsc::UnboundedSender<String>,
    reconnects: watch::Sender<u64>,
}

impl RedisBus {
    pub async fn connect(
        url: &str,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::FanoutUnavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::FanoutUnavailable(e.to_string()))?;

        let sinks: PatternSinks = Arc::new(DashMap::new());
        let (new_patterns, pattern_rx) = mpsc::unbounded_channel();
        let (reconnects, _) = watch::channel(0);

        tokio::spawn(subscriber_loop(
            client,
            sinks.clone(),
            pattern_rx,
            reconnects.clone(),
            backoff_base,
            backoff_cap,
        ));

        Ok(Self {
            manager,
            sinks,
            new_patterns,
            reconnects,
        })
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), GatewayError> {
        use redis::AsyncCommands;

        let body = payload.to_string();
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(topic, body)
            .await
            .map_err(|e| GatewayError::FanoutUnavailable(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, GatewayError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        self.sinks
            .entry(pattern.to_string())
            .or_default()
            .push(tx);
        // Tell the subscriber task to PSUBSCRIBE; if it is mid-reconnect the
        // pattern is picked up from the sink map on the next attempt anyway.
        let _ = self.new_patterns.send(pattern.to_string());
        Ok(BusSubscription {
            receiver,
            filter_task: None,
        })
    }

    fn reconnects(&self) -> watch::Receiver<u64> {
        self.reconnects.subscribe()
    }
}

async fn subscriber_loop(
    client: redis::Client,
    sinks: PatternSinks,
    mut pattern_rx: mpsc::UnboundedReceiver<String>,
    reconnects: watch::Sender<u64>,
    backoff_base: Duration,
    backoff_cap: Duration,
) {
    let mut backoff = backoff_base;

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::warn!(?e, ?backoff, "fanout subscriber connect failed");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_cap);
                continue;
            }
        };

        let patterns: Vec<String> = sinks.iter().map(|entry| entry.key().clone()).collect();
        let mut subscribed_ok = true;
        for pattern in &patterns {
            if let Err(e) = pubsub.psubscribe(pattern).await {
                tracing::warn!(?e, %pattern, "psubscribe failed");
                subscribed_ok = false;
                break;
            }
        }
        if !subscribed_ok {
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(backoff_cap);
            continue;
        }

        backoff = backoff_base;
        reconnects.send_modify(|n| *n += 1);
        tracing::info!(patterns = patterns.len(), "fanout subscriber connected");

        enum Next {
            Incoming(Option<redis::Msg>),
            NewPattern(Option<String>),
        }

        loop {
            let next = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    msg = stream.next() => Next::Incoming(msg),
                    pattern = pattern_rx.recv() => Next::NewPattern(pattern),
                }
            };

            match next {
                Next::Incoming(Some(msg)) => {
                    let topic = msg.get_channel_name().to_string();
                    let body: String = match msg.get_payload() {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::warn!(?e, %topic, "unreadable bus payload");
                            continue;
                        }
                    };
                    let payload: Value = match serde_json::from_str(&body) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(?e, %topic, "non-JSON bus payload dropped");
                            continue;
                        }
                    };
                    let message = BusMessage { topic, payload };
                    for mut entry in sinks.iter_mut() {
                        if topic_matches(entry.key(), &message.topic) {
                            entry
                                .value_mut()
                                .retain(|tx| tx.send(message.clone()).is_ok());
                        }
                    }
                }
                // Stream ended: the connection dropped. Reconnect.
                Next::Incoming(None) => break,
                Next::NewPattern(Some(pattern)) => {
                    if pubsub.psubscribe(&pattern).await.is_err() {
                        break;
                    }
                }
                // The bus itself was dropped; stop for good.
                Next::NewPattern(None) => return,
            }
        }

        tracing::warn!("fanout subscriber disconnected, reconnecting");
    }
}
