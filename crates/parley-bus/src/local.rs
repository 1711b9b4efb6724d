//! In-process bus backed by a Tokio broadcast channel.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::{Bus, BusError, BusMessage};

const DEFAULT_CAPACITY: usize = 1024;

/// A [`Bus`] that only spans the current process.
///
/// Clones share the same channel, so two servers built from clones of one
/// `LocalBus` behave like two instances attached to the same Redis.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
    capacity: usize,
}

impl LocalBus {
    /// Creates a bus buffering up to 1024 messages per subscriber.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` messages per subscriber.
    /// A subscriber that falls further behind loses the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let msg = BusMessage {
            channel: channel.to_string(),
            payload,
        };
        // No receivers just means nobody is listening yet.
        let _ = self.tx.send(msg);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if out_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "local bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out_rx)
    }
}
