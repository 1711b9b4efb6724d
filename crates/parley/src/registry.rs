//! Plain lookup tables behind the hub's lock.
//!
//! Every method is a handful of map operations; none of them await. The
//! hub clones handles out and drops the lock before doing any I/O.

use std::collections::{HashMap, HashSet};

use parley_protocol::{ClientId, RoomId};
use parley_room::{ClientHandle, RoomHandle};

#[derive(Debug)]
struct ClientEntry {
    handle: ClientHandle,
    /// Names of the rooms this client is a member of.
    rooms: HashSet<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    clients: HashMap<ClientId, ClientEntry>,
    /// Display name to every live client using it, oldest first.
    names: HashMap<String, Vec<ClientId>>,
    rooms: HashMap<String, RoomHandle>,
    room_names: HashMap<RoomId, String>,
}

impl Registry {
    /// Returns `false` if a client with the same id is already registered.
    pub(crate) fn insert_client(&mut self, handle: ClientHandle) -> bool {
        if self.clients.contains_key(&handle.id()) {
            return false;
        }
        self.names
            .entry(handle.name().to_string())
            .or_default()
            .push(handle.id());
        self.clients.insert(
            handle.id(),
            ClientEntry {
                handle,
                rooms: HashSet::new(),
            },
        );
        true
    }

    /// Removes a client, returning its handle and the live rooms it was
    /// a member of.
    pub(crate) fn remove_client(
        &mut self,
        id: ClientId,
    ) -> Option<(ClientHandle, Vec<RoomHandle>)> {
        let entry = self.clients.remove(&id)?;
        if let Some(ids) = self.names.get_mut(entry.handle.name()) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.names.remove(entry.handle.name());
            }
        }
        let rooms = entry
            .rooms
            .iter()
            .filter_map(|name| self.rooms.get(name).cloned())
            .collect();
        Some((entry.handle, rooms))
    }

    pub(crate) fn client(&self, id: ClientId) -> Option<ClientHandle> {
        self.clients.get(&id).map(|entry| entry.handle.clone())
    }

    /// The most recently registered client using `name`.
    pub(crate) fn client_by_name(&self, name: &str) -> Option<ClientHandle> {
        let id = self.names.get(name)?.last()?;
        self.client(*id)
    }

    /// How many live clients currently use `name`.
    pub(crate) fn connections_named(&self, name: &str) -> usize {
        self.names.get(name).map_or(0, Vec::len)
    }

    pub(crate) fn clients(&self) -> Vec<ClientHandle> {
        self.clients.values().map(|entry| entry.handle.clone()).collect()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn room(&self, name: &str) -> Option<RoomHandle> {
        self.rooms.get(name).cloned()
    }

    pub(crate) fn room_by_id(&self, id: RoomId) -> Option<RoomHandle> {
        let name = self.room_names.get(&id)?;
        self.room(name)
    }

    /// Registers `handle` unless a room with the same name already exists.
    pub(crate) fn insert_room(&mut self, handle: RoomHandle) {
        if self.rooms.contains_key(handle.name()) {
            return;
        }
        self.room_names.insert(handle.id(), handle.name().to_string());
        self.rooms.insert(handle.name().to_string(), handle);
    }

    pub(crate) fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Records `room` in the client's room-set. Returns `false` if the
    /// client is no longer registered.
    pub(crate) fn record_membership(&mut self, client: ClientId, room: &str) -> bool {
        match self.clients.get_mut(&client) {
            Some(entry) => {
                entry.rooms.insert(room.to_string());
                true
            }
            None => false,
        }
    }

    /// Drops `room` from the client's room-set. Returns `true` if it was there.
    pub(crate) fn forget_membership(&mut self, client: ClientId, room: &str) -> bool {
        self.clients
            .get_mut(&client)
            .is_some_and(|entry| entry.rooms.remove(room))
    }

    pub(crate) fn is_member(&self, client: ClientId, room: &str) -> bool {
        self.clients
            .get(&client)
            .is_some_and(|entry| entry.rooms.contains(room))
    }
}
