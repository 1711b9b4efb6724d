//! Room actors and client handles for Parley.
//!
//! Each room runs as an isolated Tokio task (actor model) that owns its
//! member set and fans envelopes out to members' outbound queues.
//!
//! # Key types
//!
//! - [`RoomHandle`]: send commands to a running room actor
//! - [`spawn_room`]: start a room actor
//! - [`ClientHandle`]: what a room holds for each member
//! - [`RoomConfig`]: settings shared by all rooms

mod client;
mod config;
mod error;
mod room;

pub use client::{ClientHandle, ClientQueue, DeliveryError, Frame};
pub use config::RoomConfig;
pub use error::RoomError;
pub use room::{JoinOutcome, RoomHandle, RoomInfo, RoomSpec, spawn_room};
