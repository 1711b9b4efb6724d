//! Error types for the bus layer.

use parley_protocol::ProtocolError;

/// Errors raised while publishing to or subscribing from the bus.
///
/// None of these are fatal to a server: callers log them and keep
/// delivering locally.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The Redis server refused or dropped the request.
    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// The bus has no more subscribers or has been shut down.
    #[error("bus closed")]
    Closed,

    /// The publish queue is full and the frame was dropped.
    #[error("publish queue full")]
    Saturated,

    /// A frame could not be encoded or decoded.
    #[error("invalid bus frame: {0}")]
    Frame(#[from] ProtocolError),
}
