//! `ChatServer` builder and accept loop.
//!
//! This is the entry point for running a Parley server. It ties together
//! all the layers: transport → connection actor → hub → rooms → bus.

use std::sync::Arc;

use parley_bus::Bus;
use parley_protocol::{Codec, JsonCodec};
use parley_transport::{Transport, WebSocketTransport};
use tokio::task::JoinHandle;

use crate::bridge::spawn_bridge;
use crate::config::{ConfigError, ServerConfig};
use crate::connection::{ConnectionSettings, handle_connection};
use crate::hub::Hub;
use crate::store::{ChatStore, MemoryStore};
use crate::ParleyError;

/// Builder for configuring and starting a Parley server.
///
/// # Example
///
/// ```rust,ignore
/// use parley::prelude::*;
///
/// let server = ChatServer::builder()
///     .bind("0.0.0.0:8080")
///     .bus(Arc::new(RedisBus::connect("redis://localhost:6379").await?))
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct ChatServerBuilder {
    config: ServerConfig,
    store: Option<Arc<dyn ChatStore>>,
    bus: Option<Arc<dyn Bus>>,
}

impl ChatServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            store: None,
            bus: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the persistence collaborator. Defaults to a [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attaches a cross-instance bus. Without one the server is
    /// single-instance.
    pub fn bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validates the configuration, binds the listener and starts the hub.
    ///
    /// A bus that cannot be subscribed to is logged and skipped: local
    /// delivery works without it.
    pub async fn build(self) -> Result<ChatServer<JsonCodec>, ParleyError> {
        self.config.validate().map_err(ConfigError::from)?;

        let transport = WebSocketTransport::bind_with(
            &self.config.bind_addr,
            self.config.connection_limits(),
        )
        .await?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let hub = Hub::new(
            store,
            self.bus.clone(),
            self.config.room_config(),
            JsonCodec,
        )
        .await;

        let bridge = match &self.bus {
            Some(bus) => match bus.subscribe().await {
                Ok(messages) => Some(spawn_bridge(hub.clone(), messages)),
                Err(e) => {
                    tracing::warn!(error = %e, "bus subscription failed, running single-instance");
                    None
                }
            },
            None => None,
        };

        Ok(ChatServer {
            transport,
            hub,
            bridge,
            settings: ConnectionSettings {
                heartbeat_interval: self.config.heartbeat_interval(),
                send_queue_capacity: self.config.send_queue_capacity,
            },
        })
    }
}

impl Default for ChatServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A Parley chat server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct ChatServer<C = JsonCodec> {
    transport: WebSocketTransport,
    hub: Hub<C>,
    bridge: Option<JoinHandle<()>>,
    settings: ConnectionSettings,
}

impl ChatServer<JsonCodec> {
    /// Creates a new builder.
    pub fn builder() -> ChatServerBuilder {
        ChatServerBuilder::new()
    }
}

impl<C> ChatServer<C>
where
    C: Codec + Clone,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The hub this server dispatches to.
    pub fn hub(&self) -> &Hub<C> {
        &self.hub
    }

    /// Runs the accept loop.
    ///
    /// Every accepted connection gets its own task. A failed upgrade only
    /// affects that one peer. Runs until the process is terminated.
    pub async fn run(mut self) -> Result<(), ParleyError> {
        tracing::info!(
            addr = ?self.transport.local_addr().ok(),
            bridged = self.bridge.is_some(),
            "Parley server running"
        );

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let hub = self.hub.clone();
                    let settings = self.settings;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, hub, settings).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::debug!(error = %e, "accept failed");
                }
            }
        }
    }
}

impl<C> Drop for ChatServer<C> {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
        }
    }
}
