//! Cross-instance pub/sub bridge for Parley.
//!
//! Several server processes can share one logical chat space by publishing
//! every room broadcast and every presence change on a shared bus. Each
//! process runs a single subscriber that hands what it receives back to
//! its own rooms.
//!
//! Two channel families exist:
//!
//! - `room:<name>` carries broadcasts for one room
//! - `general` carries presence events
//!
//! Every payload is a [`BusFrame`]: the envelope plus the [`InstanceId`] of
//! the process that published it, so a subscriber can drop its own echo.
//!
//! # Key types
//!
//! - [`Bus`]: the publish/subscribe seam
//! - [`LocalBus`]: in-process implementation, used by tests and single-node
//!   deployments
//! - [`RedisBus`]: Redis pub/sub implementation with reconnect backoff
//! - [`Publisher`]: a bus bound to the publishing instance's id
//!
//! # Feature Flags
//!
//! - `redis` (default): [`RedisBus`] via the `redis` crate

mod error;
mod local;
#[cfg(feature = "redis")]
mod redis_bus;

pub use error::BusError;
pub use local::LocalBus;
#[cfg(feature = "redis")]
pub use redis_bus::{Backoff, RedisBus};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_protocol::{Codec, Envelope};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel carrying presence events.
pub const GENERAL_CHANNEL: &str = "general";

/// Prefix shared by all room channels.
pub const ROOM_CHANNEL_PREFIX: &str = "room:";

/// Returns the channel that carries broadcasts for room `name`.
pub fn room_channel(name: &str) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{name}")
}

/// Returns the room name a channel belongs to, if it is a room channel.
pub fn room_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(ROOM_CHANNEL_PREFIX)
}

/// Identity of one server process on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Mints a fresh random instance id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I-{}", self.0)
    }
}

/// What travels on the bus: an envelope tagged with its publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusFrame {
    /// The instance that published this frame.
    pub origin: InstanceId,
    /// The envelope as it was delivered locally on the origin.
    pub envelope: Envelope,
}

/// One raw message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The channel it was published on.
    pub channel: String,
    /// The encoded [`BusFrame`].
    pub payload: Vec<u8>,
}

/// A shared publish/subscribe transport.
///
/// Delivery is at-most-once and unordered across publishers. A publish
/// with no subscribers is not an error.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publishes `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribes to the general channel and every room channel.
    ///
    /// The returned receiver yields messages until the bus is dropped.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BusMessage>, BusError>;
}

/// Frames waiting for the publish task before new ones are dropped.
pub const DEFAULT_PUBLISH_QUEUE: usize = 1024;

/// Longest a single bus publish may take before it is abandoned.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// A bus handle bound to the id of the instance that owns it.
///
/// Publishing never waits on the bus: frames go onto a bounded queue
/// drained by one background task, so a slow or unreachable bus costs
/// dropped remote fan-out and nothing else. Cheap to clone; every room
/// actor holds one. The task stops once the last clone is dropped.
#[derive(Clone)]
pub struct Publisher {
    queue: mpsc::Sender<(String, Vec<u8>)>,
    origin: InstanceId,
}

impl Publisher {
    /// Binds `bus` to `origin` and starts the publish task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(bus: Arc<dyn Bus>, origin: InstanceId) -> Self {
        Self::with_capacity(bus, origin, DEFAULT_PUBLISH_QUEUE)
    }

    /// Like [`new`](Self::new), with `capacity` queued frames.
    pub fn with_capacity(bus: Arc<dyn Bus>, origin: InstanceId, capacity: usize) -> Self {
        let (queue, frames) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_publisher(bus, origin, frames));
        Self { queue, origin }
    }

    /// The instance this publisher speaks for.
    pub fn origin(&self) -> InstanceId {
        self.origin
    }

    /// Wraps `envelope` in a [`BusFrame`] and queues it for `channel`.
    ///
    /// # Errors
    ///
    /// [`BusError::Saturated`] when the queue is full; the frame is
    /// dropped. [`BusError::Closed`] when the publish task is gone.
    pub fn publish<C: Codec>(
        &self,
        codec: &C,
        channel: &str,
        envelope: &Envelope,
    ) -> Result<(), BusError> {
        let frame = BusFrame {
            origin: self.origin,
            envelope: envelope.clone(),
        };
        let payload = codec.encode(&frame)?;
        self.queue
            .try_send((channel.to_string(), payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BusError::Saturated,
                mpsc::error::TrySendError::Closed(_) => BusError::Closed,
            })
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

async fn run_publisher(
    bus: Arc<dyn Bus>,
    origin: InstanceId,
    mut frames: mpsc::Receiver<(String, Vec<u8>)>,
) {
    while let Some((channel, payload)) = frames.recv().await {
        match tokio::time::timeout(PUBLISH_TIMEOUT, bus.publish(&channel, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(%origin, channel = %channel, error = %e, "bus publish failed");
            }
            Err(_) => tracing::warn!(%origin, channel = %channel, "bus publish timed out"),
        }
    }
    tracing::debug!(%origin, "publish task stopped");
}
