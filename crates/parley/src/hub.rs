//! The hub: process-wide registry of connections and rooms.
//!
//! Connection actors hand every decoded envelope to [`Hub::dispatch`],
//! which routes it by action:
//!
//! | action              | effect                                          |
//! |---------------------|-------------------------------------------------|
//! | `send-message`      | broadcast to room `target` (members only)       |
//! | `join-room`         | join public room `target`, creating it if new   |
//! | `leave-room`        | leave room `target`                             |
//! | `join-room-private` | open a private room with user `target`          |
//! | `get-room-users`    | reply with the members of room `target`         |
//! | anything else       | reply with an `error` frame                     |
//!
//! The registry lock is only held for map operations. Room joins, store
//! calls and bus publishes all happen after it has been released.

use std::collections::HashMap;
use std::sync::Arc;

use parley_bus::{
    Bus, BusFrame, BusMessage, GENERAL_CHANNEL, InstanceId, Publisher, room_from_channel,
};
use parley_protocol::{Action, ClientId, Codec, Envelope, JsonCodec, RoomId, User};
use parley_room::{ClientHandle, JoinOutcome, RoomConfig, RoomHandle, RoomSpec, spawn_room};
use tokio::sync::Mutex;

use crate::registry::Registry;
use crate::store::{ChatStore, RoomRecord};

/// Prefix reserved for two-party private rooms.
pub const PRIVATE_ROOM_PREFIX: &str = "private:";

/// Name of the private room shared by connections `a` and `b`.
///
/// Built from connection ids rather than display names, which are not
/// unique. Symmetric, so both parties resolve the same room whoever asks
/// first.
pub fn private_room_name(a: ClientId, b: ClientId) -> String {
    let (first, second) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
    format!("{PRIVATE_ROOM_PREFIX}{first}:{second}")
}

/// The room a `join-room` names. Older clients put it in `message.text`.
fn requested_room(envelope: &Envelope) -> &str {
    if envelope.target.is_empty() {
        &envelope.message.text
    } else {
        &envelope.target
    }
}

/// Cheaply cloneable handle to the process-wide hub.
pub struct Hub<C = JsonCodec> {
    inner: Arc<HubInner<C>>,
}

impl<C> Clone for Hub<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct HubInner<C> {
    instance: InstanceId,
    codec: C,
    store: Arc<dyn ChatStore>,
    publisher: Option<Publisher>,
    room_config: RoomConfig,
    registry: Mutex<Registry>,
    /// Known users keyed by display name. Advisory only.
    presence: Mutex<HashMap<String, User>>,
}

impl<C: Codec + Clone> Hub<C> {
    /// Creates a hub and warms the presence cache from `store`.
    ///
    /// A store failure is logged and leaves the cache empty. Rooms are
    /// never preloaded; they are hydrated on first lookup.
    pub async fn new(
        store: Arc<dyn ChatStore>,
        bus: Option<Arc<dyn Bus>>,
        room_config: RoomConfig,
        codec: C,
    ) -> Self {
        let instance = InstanceId::new();
        let presence = match store.get_all_users().await {
            Ok(users) => users.into_iter().map(|u| (u.name.clone(), u)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not load users, starting with empty presence");
                HashMap::new()
            }
        };
        tracing::info!(%instance, known_users = presence.len(), "hub started");

        Self {
            inner: Arc::new(HubInner {
                instance,
                codec,
                store,
                publisher: bus.map(|bus| Publisher::new(bus, instance)),
                room_config,
                registry: Mutex::new(Registry::default()),
                presence: Mutex::new(presence),
            }),
        }
    }

    /// This process's identity on the bus.
    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance
    }

    pub(crate) fn codec(&self) -> &C {
        &self.inner.codec
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Adds a connection. The first connection using a display name
    /// announces that name as online; later ones join silently.
    pub async fn register(&self, client: ClientHandle) {
        let first = {
            let mut registry = self.inner.registry.lock().await;
            if !registry.insert_client(client.clone()) {
                return;
            }
            registry.connections_named(client.name()) == 1
        };
        let user = client.user();
        tracing::info!(client_id = %client.id(), name = %client.name(), "client registered");
        if !first {
            tracing::debug!(name = %client.name(), "display name already online");
            return;
        }

        self.inner
            .presence
            .lock()
            .await
            .insert(user.name.clone(), user.clone());
        if let Err(e) = self.inner.store.add_user(&user).await {
            tracing::warn!(error = %e, "could not record user");
        }

        let notice = Envelope::new(Action::UserJoined, "").with_sender(user);
        self.announce(&notice, Some(client.id())).await;
        self.publish(GENERAL_CHANNEL, &notice);
    }

    /// Removes a connection from the registry and from every room it
    /// joined. The display name is announced as offline once its last
    /// connection is gone. Safe to call more than once.
    pub async fn unregister(&self, client_id: ClientId) {
        let (removed, last) = {
            let mut registry = self.inner.registry.lock().await;
            let removed = registry.remove_client(client_id);
            let last = removed
                .as_ref()
                .is_some_and(|(client, _)| registry.connections_named(client.name()) == 0);
            (removed, last)
        };
        let Some((client, rooms)) = removed else {
            return;
        };
        tracing::info!(%client_id, rooms = rooms.len(), "client unregistered");

        for room in rooms {
            if let Err(e) = room.leave(client_id).await {
                tracing::debug!(room = %room.name(), error = %e, "leave on disconnect failed");
            }
        }

        if !last {
            return;
        }
        let user = client.user();
        self.inner.presence.lock().await.remove(&user.name);
        if let Err(e) = self.inner.store.remove_user(&user).await {
            tracing::warn!(error = %e, "could not remove user");
        }

        let notice = Envelope::new(Action::UserLeft, "").with_sender(user);
        self.announce(&notice, None).await;
        self.publish(GENERAL_CHANNEL, &notice);
    }

    /// The most recently registered local connection using `name`.
    pub async fn find_client_by_name(&self, name: &str) -> Option<ClientHandle> {
        self.inner.registry.lock().await.client_by_name(name)
    }

    pub async fn client_count(&self) -> usize {
        self.inner.registry.lock().await.client_count()
    }

    /// Users currently believed online, ordered by name.
    pub async fn known_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.inner.presence.lock().await.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    /// Looks a room up by name: the live registry first, then the store.
    /// A stored room is started on the spot with its persisted identity.
    pub async fn find_room_by_name(&self, name: &str) -> Option<RoomHandle> {
        if let Some(room) = self.live_room(name).await {
            return Some(room);
        }

        match self.inner.store.get_room_by_name(name).await {
            Ok(Some(record)) => {
                tracing::debug!(room = %name, room_id = %record.id, "hydrating room");
                let spec = RoomSpec {
                    id: record.id,
                    name: record.name,
                    private: record.private,
                };
                Some(self.install_room(spec).await.0)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(room = %name, error = %e, "room lookup failed");
                None
            }
        }
    }

    pub async fn find_room_by_id(&self, id: RoomId) -> Option<RoomHandle> {
        self.inner.registry.lock().await.room_by_id(id)
    }

    /// Starts a new room and records it in the store.
    ///
    /// If a room with this name went live concurrently, that one is
    /// returned instead and nothing is recorded.
    pub async fn create_room(&self, name: &str, private: bool) -> RoomHandle {
        let spec = RoomSpec {
            id: RoomId::new(),
            name: name.to_string(),
            private,
        };
        let (room, created) = self.install_room(spec).await;
        if created {
            tracing::info!(room = %name, room_id = %room.id(), private, "room created");
            let record = RoomRecord {
                id: room.id(),
                name: name.to_string(),
                private,
            };
            if let Err(e) = self.inner.store.add_room(&record).await {
                tracing::warn!(room = %name, error = %e, "could not record room");
            }
        }
        room
    }

    pub async fn room_count(&self) -> usize {
        self.inner.registry.lock().await.room_count()
    }

    async fn live_room(&self, name: &str) -> Option<RoomHandle> {
        self.inner.registry.lock().await.room(name)
    }

    /// Spawns the room unless one with the same name is already live.
    /// Returns the live handle and whether it was spawned here.
    async fn install_room(&self, spec: RoomSpec) -> (RoomHandle, bool) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(existing) = registry.room(&spec.name) {
            return (existing, false);
        }
        let room = spawn_room(
            spec,
            self.inner.room_config,
            self.inner.codec.clone(),
            self.inner.publisher.clone(),
        );
        registry.insert_room(room.clone());
        (room, true)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Routes one envelope received from `sender`.
    ///
    /// The envelope's `sender` field is replaced with the connection's own
    /// identity. Nothing here fails the connection.
    pub async fn dispatch(&self, sender: ClientId, envelope: Envelope) {
        let Some(client) = self.inner.registry.lock().await.client(sender) else {
            tracing::debug!(client_id = %sender, "dropping envelope from unregistered client");
            return;
        };
        let envelope = envelope.with_sender(client.user());
        let action = envelope.action.clone();

        match action {
            Action::SendMessage => self.send_message(&client, envelope).await,
            Action::JoinRoom => self.join_public(&client, requested_room(&envelope)).await,
            Action::LeaveRoom => self.leave(&client, &envelope.target).await,
            Action::JoinRoomPrivate => self.join_private(&client, &envelope.target).await,
            Action::GetRoomUsers => self.list_members(&client, &envelope.target).await,
            other => {
                tracing::debug!(client_id = %sender, action = %other, "unknown action");
                self.send_to(&client, &Envelope::error(other.as_str(), "unknown action"));
            }
        }
    }

    async fn send_message(&self, client: &ClientHandle, envelope: Envelope) {
        let name = envelope.target.clone();
        let Some(room) = self.live_room(&name).await else {
            tracing::debug!(client_id = %client.id(), room = %name, "message for unknown room");
            return;
        };
        let member = self.inner.registry.lock().await.is_member(client.id(), &name);
        if !member {
            self.send_to(client, &Envelope::error(name, "illegal action"));
            return;
        }
        if let Err(e) = room.broadcast(envelope).await {
            tracing::warn!(room = %name, error = %e, "broadcast failed");
        }
    }

    async fn join_public(&self, client: &ClientHandle, name: &str) {
        if name.is_empty() || name.starts_with(PRIVATE_ROOM_PREFIX) {
            tracing::debug!(client_id = %client.id(), room = %name, "refusing public join");
            return;
        }
        let room = match self.find_room_by_name(name).await {
            Some(room) => room,
            None => self.create_room(name, false).await,
        };
        if room.is_private() {
            tracing::debug!(client_id = %client.id(), room = %name, "public join of private room");
            return;
        }
        self.join(client, &room).await;
    }

    /// Two-party private join: both `client` and the most recent
    /// connection named `target` end up in the same private room.
    async fn join_private(&self, client: &ClientHandle, target: &str) {
        let Some(peer) = self.find_client_by_name(target).await else {
            tracing::debug!(client_id = %client.id(), peer = %target, "private join target offline");
            return;
        };
        if peer.id() == client.id() || peer.name() == client.name() {
            return;
        }

        let name = private_room_name(client.id(), peer.id());
        let room = match self.find_room_by_name(&name).await {
            Some(room) => room,
            None => self.create_room(&name, true).await,
        };
        if !room.is_private() {
            tracing::warn!(room = %name, "private room name taken by a public room");
            return;
        }
        self.join(client, &room).await;
        self.join(&peer, &room).await;
    }

    /// Joins `client` to `room`, keeping the client's room-set in step
    /// with the room's member set.
    async fn join(&self, client: &ClientHandle, room: &RoomHandle) {
        let registered = self
            .inner
            .registry
            .lock()
            .await
            .record_membership(client.id(), room.name());
        if !registered {
            return;
        }

        match room.join(client.clone()).await {
            Ok(JoinOutcome::Joined) => {
                let ack = Envelope::new(Action::RoomJoined, room.name())
                    .with_sender(client.user())
                    .with_text(room.id().to_string());
                self.send_to(client, &ack);
            }
            Ok(JoinOutcome::AlreadyMember) => {}
            Err(e) => {
                tracing::warn!(room = %room.name(), error = %e, "join failed");
                self.inner
                    .registry
                    .lock()
                    .await
                    .forget_membership(client.id(), room.name());
            }
        }
    }

    async fn leave(&self, client: &ClientHandle, name: &str) {
        self.inner
            .registry
            .lock()
            .await
            .forget_membership(client.id(), name);
        let Some(room) = self.live_room(name).await else {
            return;
        };
        if let Err(e) = room.leave(client.id()).await {
            tracing::warn!(room = %name, error = %e, "leave failed");
        }
    }

    async fn list_members(&self, client: &ClientHandle, name: &str) {
        let member = self.inner.registry.lock().await.is_member(client.id(), name);
        if !member {
            return;
        }
        let Some(room) = self.live_room(name).await else {
            return;
        };
        match room.members().await {
            Ok(members) => {
                let reply = Envelope::new(Action::RoomUsers, name).with_members(members);
                self.send_to(client, &reply);
            }
            Err(e) => tracing::warn!(room = %name, error = %e, "member listing failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Bus
    // -----------------------------------------------------------------------

    /// Applies one message received from the bus.
    ///
    /// Room traffic is relayed to the local room of the same name, if one
    /// is live; it is never published again and never creates a room.
    /// Frames this instance published itself are dropped.
    pub async fn handle_bus_message(&self, msg: BusMessage) {
        let frame: BusFrame = match self.inner.codec.decode(&msg.payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(channel = %msg.channel, error = %e, "undecodable bus frame");
                return;
            }
        };
        if frame.origin == self.inner.instance {
            return;
        }

        if msg.channel == GENERAL_CHANNEL {
            self.apply_remote_presence(frame.envelope).await;
            return;
        }

        let Some(name) = room_from_channel(&msg.channel) else {
            tracing::debug!(channel = %msg.channel, "ignoring unknown bus channel");
            return;
        };
        let Some(room) = self.live_room(name).await else {
            return;
        };
        if let Err(e) = room.relay(frame.envelope).await {
            tracing::debug!(room = %name, error = %e, "relay failed");
        }
    }

    async fn apply_remote_presence(&self, envelope: Envelope) {
        let user = envelope.sender.clone();
        match envelope.action {
            Action::UserJoined => {
                self.inner.presence.lock().await.insert(user.name.clone(), user);
            }
            Action::UserLeft => {
                self.inner.presence.lock().await.remove(&user.name);
            }
            ref other => {
                tracing::debug!(action = %other, "ignoring presence event");
                return;
            }
        }
        self.announce(&envelope, None).await;
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Sends `envelope` to every local connection except `skip`.
    async fn announce(&self, envelope: &Envelope, skip: Option<ClientId>) {
        let Some(frame) = self.encode(envelope) else {
            return;
        };
        let clients = self.inner.registry.lock().await.clients();
        for client in clients {
            if Some(client.id()) != skip {
                client.deliver_or_kick(Arc::clone(&frame));
            }
        }
    }

    fn send_to(&self, client: &ClientHandle, envelope: &Envelope) {
        if let Some(frame) = self.encode(envelope) {
            client.deliver_or_kick(frame);
        }
    }

    fn encode(&self, envelope: &Envelope) -> Option<Arc<[u8]>> {
        match self.inner.codec.encode(envelope) {
            Ok(bytes) => Some(Arc::from(bytes)),
            Err(e) => {
                tracing::warn!(action = %envelope.action, error = %e, "could not encode envelope");
                None
            }
        }
    }

    fn publish(&self, channel: &str, envelope: &Envelope) {
        let Some(publisher) = &self.inner.publisher else {
            return;
        };
        if let Err(e) = publisher.publish(&self.inner.codec, channel, envelope) {
            tracing::warn!(channel, error = %e, "bus publish failed");
        }
    }
}
