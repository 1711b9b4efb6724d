//! Persistence collaborator.
//!
//! The hub only talks to storage at a few boundaries: loading known users
//! at startup, hydrating a room on a lookup miss, and recording rooms and
//! users as they appear and disappear. Every failure is logged by the
//! caller and never aborts anything.

use std::collections::HashMap;

use async_trait::async_trait;
use parley_protocol::{RoomId, User};
use tokio::sync::Mutex;

/// Errors a [`ChatStore`] may report.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record with the same key already exists.
    #[error("duplicate record: {0}")]
    Duplicate(String),
}

/// A persisted room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub private: bool,
}

/// Storage for rooms and known users.
#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    /// Every user the store knows about. Called once at hub construction.
    async fn get_all_users(&self) -> Result<Vec<User>, StoreError>;

    /// The room named `name`, if one was recorded.
    async fn get_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, StoreError>;

    async fn add_room(&self, room: &RoomRecord) -> Result<(), StoreError>;

    async fn add_user(&self, user: &User) -> Result<(), StoreError>;

    async fn remove_user(&self, user: &User) -> Result<(), StoreError>;
}

/// A [`ChatStore`] kept in process memory. Rooms are keyed by name and
/// users by display name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, RoomRecord>>,
    users: Mutex<HashMap<String, User>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `rooms` and `users`.
    pub fn seeded(rooms: Vec<RoomRecord>, users: Vec<User>) -> Self {
        Self {
            rooms: Mutex::new(rooms.into_iter().map(|r| (r.name.clone(), r)).collect()),
            users: Mutex::new(users.into_iter().map(|u| (u.name.clone(), u)).collect()),
        }
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn get_all_users(&self) -> Result<Vec<User>, StoreError> {
        let users = self.users.lock().await;
        Ok(users.values().cloned().collect())
    }

    async fn get_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, StoreError> {
        let rooms = self.rooms.lock().await;
        Ok(rooms.get(name).cloned())
    }

    async fn add_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().await;
        if rooms.contains_key(&room.name) {
            return Err(StoreError::Duplicate(room.name.clone()));
        }
        rooms.insert(room.name.clone(), room.clone());
        Ok(())
    }

    async fn add_user(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        users.insert(user.name.clone(), user.clone());
        Ok(())
    }

    async fn remove_user(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        users.remove(&user.name);
        Ok(())
    }
}
