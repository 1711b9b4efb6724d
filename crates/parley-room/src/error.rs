//! Error types for the room layer.

use parley_protocol::RoomId;

/// Errors that can occur while talking to a room actor.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The room's command channel is closed: the actor has stopped.
    #[error("room {0} is unavailable")]
    Unavailable(RoomId),

    /// The outbound frame could not be encoded.
    #[error("could not encode frame: {0}")]
    Encode(#[from] parley_protocol::ProtocolError),
}
