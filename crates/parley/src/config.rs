//! Server configuration.
//!
//! Loaded from environment variables with the `PARLEY` prefix and `__` as
//! the separator, after reading a `.env` file if one is present:
//!
//! - `PARLEY__BIND_ADDR=0.0.0.0:8080`
//! - `PARLEY__READ_TIMEOUT_MS=60000`
//! - `PARLEY__REDIS_URL=redis://localhost:6379`

use std::time::Duration;

use parley_room::RoomConfig;
use parley_transport::ConnectionLimits;
use serde::Deserialize;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("validation failed: {0}")]
    Invalid(#[from] ValidationError),
}

/// Semantic problems with an otherwise well-formed configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("heartbeat interval must be shorter than the read timeout")]
    HeartbeatTooSlow,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid Redis URL format")]
    InvalidRedisUrl,
}

/// Everything a [`ChatServer`](crate::ChatServer) needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,

    /// Maximum silence tolerated from a client, in milliseconds.
    pub read_timeout_ms: u64,

    /// Maximum time one flush to a client may take, in milliseconds.
    pub write_timeout_ms: u64,

    /// How often a heartbeat ping is sent, in milliseconds. Must be below
    /// `read_timeout_ms` so a healthy client always answers in time.
    pub heartbeat_interval_ms: u64,

    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,

    /// Frames a client's outbound queue may hold before it is disconnected.
    pub send_queue_capacity: usize,

    /// Commands a room's intake queue may hold.
    pub room_queue_capacity: usize,

    /// Redis URL for the cross-instance bus. Single-instance when unset.
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            read_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            heartbeat_interval_ms: 54_000,
            max_message_size: 4096,
            send_queue_capacity: 256,
            room_queue_capacity: 256,
            redis_url: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `.env` and the environment.
    ///
    /// Unset variables keep their defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("PARLEY")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.read_timeout_ms == 0 {
            return Err(ValidationError::Zero("read_timeout_ms"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ValidationError::Zero("write_timeout_ms"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ValidationError::Zero("heartbeat_interval_ms"));
        }
        if self.heartbeat_interval_ms >= self.read_timeout_ms {
            return Err(ValidationError::HeartbeatTooSlow);
        }
        if self.max_message_size == 0 {
            return Err(ValidationError::Zero("max_message_size"));
        }
        if self.send_queue_capacity == 0 {
            return Err(ValidationError::Zero("send_queue_capacity"));
        }
        if self.room_queue_capacity == 0 {
            return Err(ValidationError::Zero("room_queue_capacity"));
        }
        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(ValidationError::InvalidRedisUrl);
            }
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Per-connection limits handed to the transport.
    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            read_timeout: self.read_timeout(),
            write_timeout: self.write_timeout(),
            max_message_size: self.max_message_size,
        }
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            queue_capacity: self.room_queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(54));
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_heartbeat_must_beat_read_timeout() {
        let config = ServerConfig {
            heartbeat_interval_ms: 60_000,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::HeartbeatTooSlow));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let config = ServerConfig {
            send_queue_capacity: 0,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::Zero("send_queue_capacity"))
        );
    }

    #[test]
    fn test_redis_url_scheme_is_checked() {
        let bad = ServerConfig {
            redis_url: Some("http://localhost:6379".into()),
            ..ServerConfig::default()
        };
        assert_eq!(bad.validate(), Err(ValidationError::InvalidRedisUrl));

        let good = ServerConfig {
            redis_url: Some("redis://localhost:6379".into()),
            ..ServerConfig::default()
        };
        assert_eq!(good.validate(), Ok(()));
    }

    #[test]
    fn test_connection_limits_follow_config() {
        let config = ServerConfig {
            read_timeout_ms: 500,
            write_timeout_ms: 100,
            max_message_size: 64,
            ..ServerConfig::default()
        };
        let limits = config.connection_limits();
        assert_eq!(limits.read_timeout, Duration::from_millis(500));
        assert_eq!(limits.write_timeout, Duration::from_millis(100));
        assert_eq!(limits.max_message_size, 64);
    }
}
