//! Parley chat server.
//!
//! Configuration comes from `PARLEY__*` environment variables (or a `.env`
//! file). Set `PARLEY__REDIS_URL` to share rooms with other instances.
//!
//! ```bash
//! RUST_LOG=info PARLEY__BIND_ADDR=0.0.0.0:8080 cargo run -p chat-server
//! ```
//!
//! Then connect with any WebSocket client:
//!
//! ```text
//! ws://localhost:8080/ws?name=alice
//! {"action":"join-room","target":"lobby"}
//! {"action":"send-message","target":"lobby","message":{"text":"hi"}}
//! ```

use std::sync::Arc;

use parley::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ParleyError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::load()?;
    let mut builder = ChatServer::builder().config(config.clone());

    if let Some(url) = &config.redis_url {
        match RedisBus::connect(url).await {
            Ok(bus) => builder = builder.bus(Arc::new(bus)),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, running single-instance");
            }
        }
    }

    let server = builder.build().await?;
    server.run().await
}
