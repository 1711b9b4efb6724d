//! Unified error type for Parley.

use parley_bus::BusError;
use parley_protocol::ProtocolError;
use parley_room::RoomError;
use parley_transport::TransportError;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Top-level error that wraps all crate-specific errors.
///
/// `#[from]` on each variant lets `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    /// A transport-level error (accept, send, recv, deadline).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The cross-instance bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A room actor is gone.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// The persistence collaborator failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationError;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::Rejected("gone".into());
        let parley_err: ParleyError = err.into();
        assert!(matches!(parley_err, ParleyError::Transport(_)));
        assert!(parley_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let parley_err: ParleyError = err.into();
        assert!(matches!(parley_err, ParleyError::Protocol(_)));
    }

    #[test]
    fn test_from_bus_error() {
        let parley_err: ParleyError = BusError::Closed.into();
        assert!(matches!(parley_err, ParleyError::Bus(_)));
    }

    #[test]
    fn test_from_room_error() {
        let err = RoomError::Unavailable(parley_protocol::RoomId::new());
        let parley_err: ParleyError = err.into();
        assert!(matches!(parley_err, ParleyError::Room(_)));
    }

    #[test]
    fn test_from_config_error() {
        let err = ConfigError::from(ValidationError::InvalidRedisUrl);
        let parley_err: ParleyError = err.into();
        assert!(parley_err.to_string().contains("Redis URL"));
    }
}
