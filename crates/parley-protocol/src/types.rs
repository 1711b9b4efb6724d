//! Core protocol types for Parley's wire format.
//!
//! Every frame exchanged with a client, and every payload published on the
//! bus, is one [`Envelope`]:
//!
//! ```text
//! { "action": string, "target": string,
//!   "sender": { "id"?: uuid, "name": string },
//!   "message": { "text": string, "members"?: [user] } }
//! ```
//!
//! `target` is a room name for room traffic, a display name for private
//! joins, and empty for presence events.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identity of one live connection. Minted when the upgrade succeeds and
/// never reused.
///
/// `#[serde(transparent)]` keeps it a bare UUID string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Mints a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

/// Identity of a room. Stable across restarts when the room is hydrated
/// from a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub Uuid);

impl RoomId {
    /// Mints a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// What an envelope asks for (client → server) or announces
/// (server → client).
///
/// Actions travel as kebab-case strings. Several have legacy aliases that
/// are accepted on input but never produced. Any string not in the table
/// decodes to [`Action::Unknown`] so that an unrecognized action is a
/// recoverable condition rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Client → Server: broadcast `message.text` to room `target`.
    SendMessage,
    /// Client → Server: join (or create) public room `target`.
    JoinRoom,
    /// Client → Server: leave room `target`.
    LeaveRoom,
    /// Client → Server: open a private room with user `target`.
    JoinRoomPrivate,
    /// Client → Server: list the members of room `target`.
    GetRoomUsers,
    /// Server → Client: someone joined a room or came online.
    UserJoined,
    /// Server → Client: someone left a room or went offline.
    UserLeft,
    /// Server → Client: the recipient is now a member of room `target`.
    RoomJoined,
    /// Server → Client: reply to [`Action::GetRoomUsers`].
    RoomUsers,
    /// Server → Client: a request could not be honoured.
    Error,
    /// Anything else, preserved verbatim.
    Unknown(String),
}

impl Action {
    /// Returns the canonical wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SendMessage => "send-message",
            Self::JoinRoom => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::JoinRoomPrivate => "join-room-private",
            Self::GetRoomUsers => "get-room-users",
            Self::UserJoined => "user-joined",
            Self::UserLeft => "user-left",
            Self::RoomJoined => "room-joined",
            Self::RoomUsers => "room-users",
            Self::Error => "error",
            Self::Unknown(raw) => raw,
        }
    }

    /// Resolves a wire name, accepting legacy aliases.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "send-message" => Self::SendMessage,
            "join-room" | "join-chat" => Self::JoinRoom,
            "leave-room" | "leave-chat" => Self::LeaveRoom,
            "join-room-private" | "join-chat-private" => Self::JoinRoomPrivate,
            "get-room-users" | "get-chat-users" => Self::GetRoomUsers,
            "user-joined" | "user-join" => Self::UserJoined,
            "user-left" => Self::UserLeft,
            "room-joined" | "chat-joined" => Self::RoomJoined,
            "room-users" => Self::RoomUsers,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// The identity stub attached to an envelope as its `sender`.
///
/// Clients may send anything here; the server always overwrites it with
/// the identity of the connection the frame arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    /// Connection id of the sender, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ClientId>,
    /// Display name supplied when the connection was opened.
    #[serde(default)]
    pub name: String,
}

impl User {
    /// Creates a stub for a live connection.
    pub fn new(id: ClientId, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
        }
    }

    /// Creates a stub known only by name (e.g. loaded from the user store).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageBody
// ---------------------------------------------------------------------------

/// The payload of an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Free text: the chat message, a notice, or an error reason.
    #[serde(default)]
    pub text: String,
    /// Member listing, only present on [`Action::RoomUsers`] replies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<User>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One logical message. Immutable once built; cloned, never mutated in
/// place, when it has to be re-addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// What this envelope asks for or announces.
    pub action: Action,
    /// Room name, room id, or display name depending on `action`.
    #[serde(default)]
    pub target: String,
    /// Who sent it.
    #[serde(default, deserialize_with = "null_as_default")]
    pub sender: User,
    /// The payload.
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: MessageBody,
}

impl Envelope {
    /// Creates an envelope with an empty sender and payload.
    pub fn new(action: Action, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            sender: User::default(),
            message: MessageBody::default(),
        }
    }

    /// Returns a copy addressed from `sender`.
    pub fn with_sender(mut self, sender: User) -> Self {
        self.sender = sender;
        self
    }

    /// Returns a copy carrying `text` as its payload.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.message.text = text.into();
        self
    }

    /// Returns a copy carrying a member listing.
    pub fn with_members(mut self, members: Vec<User>) -> Self {
        self.message.members = members;
        self
    }

    /// Builds an error frame. `target` names what was rejected.
    pub fn error(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(Action::Error, target).with_text(reason)
    }
}

/// Treats an explicit `null` the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ===========================================================================
// Tests
// ===========================================================================
