//! Redis pub/sub implementation of [`Bus`].
//!
//! Publishing goes through a `ConnectionManager` shared by every room; it
//! reconnects on its own after the server drops the link.
//! Subscribing opens a dedicated pub/sub connection owned by a background
//! task; when that connection drops, the task reconnects with jittered
//! exponential backoff and the receiver handed to the caller stays open.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSub};
use tokio::sync::mpsc;

use crate::{Bus, BusError, BusMessage, GENERAL_CHANNEL, ROOM_CHANNEL_PREFIX};

const SUBSCRIPTION_BUFFER: usize = 1024;

/// Reconnect delay policy for the subscriber task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on the un-jittered delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (zero-based): doubles each time
    /// up to `max`, plus up to 20% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max);
        let spread = (base.as_millis() / 5) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        base + Duration::from_millis(jitter)
    }
}

/// A [`Bus`] backed by Redis pub/sub.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    backoff: Backoff,
}

impl RedisBus {
    /// Connects to the Redis server at `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        Self::connect_with(url, Backoff::default()).await
    }

    /// Connects using a custom reconnect policy.
    pub async fn connect_with(url: &str, backoff: Backoff) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        tracing::info!("connected to redis bus");
        Ok(Self {
            client,
            publisher,
            backoff,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        // The first connection is made eagerly so a bad URL or a dead
        // server surfaces to the caller instead of looping in the background.
        let pubsub = open_pubsub(&self.client).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(run_subscriber(
            self.client.clone(),
            pubsub,
            tx,
            self.backoff,
        ));
        Ok(rx)
    }
}

async fn open_pubsub(client: &redis::Client) -> Result<PubSub, BusError> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(GENERAL_CHANNEL).await?;
    pubsub.psubscribe(format!("{ROOM_CHANNEL_PREFIX}*")).await?;
    Ok(pubsub)
}

/// Forwards pub/sub messages into `tx` until the receiver is dropped,
/// reconnecting whenever the Redis connection is lost.
async fn run_subscriber(
    client: redis::Client,
    initial: PubSub,
    tx: mpsc::Sender<BusMessage>,
    backoff: Backoff,
) {
    let mut current = Some(initial);
    let mut attempt: u32 = 0;

    loop {
        let pubsub = match current.take() {
            Some(pubsub) => pubsub,
            None => match open_pubsub(&client).await {
                Ok(pubsub) => {
                    tracing::info!(attempt, "redis subscription restored");
                    attempt = 0;
                    pubsub
                }
                Err(e) => {
                    let delay = backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(error = %e, ?delay, "redis resubscribe failed");
                    tokio::time::sleep(delay).await;
                    if tx.is_closed() {
                        return;
                    }
                    continue;
                }
            },
        };

        let mut messages = pubsub.into_on_message();
        while let Some(msg) = messages.next().await {
            let payload: Vec<u8> = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unreadable redis message");
                    continue;
                }
            };
            let message = BusMessage {
                channel: msg.get_channel_name().to_string(),
                payload,
            };
            if tx.send(message).await.is_err() {
                tracing::debug!("bus receiver dropped, stopping redis subscriber");
                return;
            }
        }

        if tx.is_closed() {
            return;
        }
        tracing::warn!("redis subscription lost, reconnecting");
    }
}
