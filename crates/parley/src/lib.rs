//! # Parley
//!
//! Real-time chat fan-out server.
//!
//! Clients connect over WebSocket with a display name, join named rooms and
//! exchange JSON envelopes. Each connection and each room runs as its own
//! task; a process-wide [`Hub`] routes between them. Several processes can
//! share one chat space through a [`Bus`](parley_bus::Bus).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parley::prelude::*;
//!
//! # async fn start() -> Result<(), ParleyError> {
//! let server = ChatServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod bridge;
mod config;
mod connection;
mod error;
mod hub;
mod registry;
mod server;
mod store;

pub use bridge::spawn_bridge;
pub use config::{ConfigError, ServerConfig, ValidationError};
pub use error::ParleyError;
pub use hub::{Hub, PRIVATE_ROOM_PREFIX, private_room_name};
pub use server::{ChatServer, ChatServerBuilder};
pub use store::{ChatStore, MemoryStore, RoomRecord, StoreError};

/// Everything needed to build and run a server.
pub mod prelude {
    pub use crate::{
        ChatServer, ChatServerBuilder, ChatStore, Hub, MemoryStore, ParleyError, RoomRecord,
        ServerConfig,
    };
    pub use parley_bus::{Bus, LocalBus, RedisBus};
    pub use parley_protocol::{Action, ClientId, Envelope, JsonCodec, MessageBody, RoomId, User};
    pub use parley_room::{ClientHandle, RoomConfig, RoomHandle};
}
