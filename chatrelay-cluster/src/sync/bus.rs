//! Broadcast bus for cross-instance message fan-out
//!
//! Every instance publishes persisted messages to a shared channel and
//! receives every published message back, including its own. Delivery to
//! local room members happens only from the subscription side, so one code
//! path serves local and remote messages alike.

use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chatrelay_core::models::Message;
use chatrelay_core::{Error, Result};

/// Channel all instances publish to and subscribe from
pub const MESSAGE_CHANNEL: &str = "chatrelay:messages";

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Callback invoked for every message received from the bus.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Transport abstraction over the shared broadcast channel.
///
/// A publish that returns `Ok` means the transport accepted the message; it
/// does not wait for delivery. Subscribers receive every published message,
/// the publisher's own included.
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Publish one message to the shared channel.
    async fn publish(&self, message: &Message) -> Result<()>;

    /// Install the handler and start receiving published messages.
    fn subscribe(&self, handler: MessageHandler);

    /// Stop the subscription task. Called on graceful shutdown; the
    /// default is a no-op for transports whose task ends with the channel.
    fn shutdown(&self) {}
}

/// Redis Pub/Sub backed bus.
///
/// Publishing goes through a `ConnectionManager` so a failure surfaces
/// immediately to the caller instead of queueing behind a retry loop; the
/// caller decides what to do with an unreachable bus. The subscriber task
/// reconnects on its own with exponential backoff.
pub struct RedisBus {
    redis_client: RedisClient,
    publish_conn: ConnectionManager,
    cancel_token: CancellationToken,
}

impl RedisBus {
    /// Connect to Redis and prepare the publish connection.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)
            .map_err(|e| Error::BusUnavailable(format!("invalid Redis URL: {e}")))?;

        let publish_conn = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            ConnectionManager::new(redis_client.clone()),
        )
        .await
        .map_err(|_| Error::BusUnavailable("timed out connecting to Redis".to_string()))??;

        info!(channel = MESSAGE_CHANNEL, "Connected to Redis bus");

        Ok(Self {
            redis_client,
            publish_conn,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Run one subscriber connection until it fails or the stream ends.
    async fn run_subscriber(client: &RedisClient, handler: &MessageHandler) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(format!(
                    "failed to get Redis Pub/Sub connection: {e}"
                ));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(
                    "timed out getting Redis Pub/Sub connection".to_string(),
                );
            }
        };

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(MESSAGE_CHANNEL),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(format!(
                    "failed to subscribe to {MESSAGE_CHANNEL}: {e}"
                ));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(format!(
                    "timed out subscribing to {MESSAGE_CHANNEL}"
                ));
            }
        }

        info!(channel = MESSAGE_CHANNEL, "Redis subscriber connected");

        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Invalid payload on message channel");
                    continue;
                }
            };

            match serde_json::from_str::<Message>(&payload) {
                Ok(message) => {
                    debug!(
                        message_id = %message.id,
                        room = %message.room,
                        "Received message from bus"
                    );
                    handler(message);
                }
                Err(e) => {
                    warn!(error = %e, payload = %payload, "Failed to deserialize bus message");
                }
            }
        }

        // Stream returned None -- the Redis connection was lost
        SubscriberExit::Disconnected
    }
}

#[async_trait]
impl BroadcastBus for RedisBus {
    async fn publish(&self, message: &Message) -> Result<()> {
        let payload = serde_json::to_string(message)?;

        let mut conn = self.publish_conn.clone();
        let subscribers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(MESSAGE_CHANNEL, &payload),
        )
        .await
        .map_err(|_| Error::BusUnavailable("timed out publishing to Redis".to_string()))??;

        debug!(
            message_id = %message.id,
            subscribers = subscribers,
            "Message published to bus"
        );

        Ok(())
    }

    fn subscribe(&self, handler: MessageHandler) {
        let client = self.redis_client.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if cancel_token.is_cancelled() {
                    info!("Redis subscriber task cancelled");
                    return;
                }

                match Self::run_subscriber(&client, &handler).await {
                    SubscriberExit::Disconnected => {
                        // Connection was healthy before it dropped.
                        // Reset backoff since the server was reachable.
                        error!(
                            "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(reason) => {
                        error!(
                            reason = %reason,
                            backoff_secs = backoff_secs,
                            "Redis subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Redis subscriber task cancelled during backoff");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });
    }

    fn shutdown(&self) {
        info!("Shutting down Redis bus");
        self.cancel_token.cancel();
    }
}

/// Describes how the subscriber loop exited, enabling proper backoff behavior.
enum SubscriberExit {
    /// Connection was established and messages were being processed, but the
    /// stream ended (Redis disconnected). Backoff should be reset since the
    /// connection was healthy before it dropped.
    Disconnected,
    /// Failed to connect or subscribe to Redis. Backoff should continue
    /// increasing to avoid hammering an unavailable server.
    ConnectFailed(String),
}

/// In-process bus for single-instance deployments and tests.
///
/// Echo semantics match `RedisBus`: subscribers receive every published
/// message, the publisher's own included. Multiple coordinators can share
/// one `LoopbackBus` to simulate a multi-instance cluster.
pub struct LoopbackBus {
    sender: broadcast::Sender<Message>,
    fail_publishes: AtomicBool,
}

impl LoopbackBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Make subsequent publishes fail (for testing the fallback path)
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastBus for LoopbackBus {
    async fn publish(&self, message: &Message) -> Result<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(Error::BusUnavailable("loopback bus unavailable".to_string()));
        }
        // A send error only means no subscriber exists yet
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    fn subscribe(&self, handler: MessageHandler) {
        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => handler(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Loopback subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}
