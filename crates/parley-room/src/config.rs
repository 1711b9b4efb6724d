//! Room configuration.

use serde::{Deserialize, Serialize};

/// Settings shared by every room a hub spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Capacity of each room's intake queue. When it is full, callers wait.
    pub queue_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}
