//! Wire protocol for Parley.
//!
//! This crate defines what clients, servers and peer instances exchange:
//!
//! - **Types** ([`Envelope`], [`Action`], [`User`], [`MessageBody`]):
//!   the one message shape that travels on every connection and on the bus.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how envelopes are
//!   converted to/from bytes.
//! - **Errors** ([`ProtocolError`]): what can go wrong during
//!   encoding/decoding.
//!
//! The protocol layer knows nothing about connections or rooms; it only
//! knows how to name actions and serialize envelopes.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Hub / Room actors
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{Action, ClientId, Envelope, MessageBody, RoomId, User};
