//! Room actor: an isolated Tokio task that owns one room's membership.
//!
//! Every join, leave and broadcast for a room arrives on the same bounded
//! intake queue and is handled to completion before the next one is read.
//! Nothing outside the task ever touches the member map.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parley_bus::{Publisher, room_channel};
use parley_protocol::{Action, ClientId, Codec, Envelope, RoomId, User};
use tokio::sync::{mpsc, oneshot};

use crate::{ClientHandle, DeliveryError, Frame, RoomConfig, RoomError};

/// Identity of a room to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    pub id: RoomId,
    pub name: String,
    /// Private rooms are only reachable through the two-party private
    /// join and never announce joins.
    pub private: bool,
}

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The client was added.
    Joined,
    /// The client was already a member; nothing changed.
    AlreadyMember,
}

/// Commands sent to a room actor through its channel.
pub(crate) enum RoomCommand {
    Join {
        client: ClientHandle,
        reply: oneshot::Sender<JoinOutcome>,
    },

    /// Replies `true` if the client was a member.
    Leave {
        client_id: ClientId,
        reply: oneshot::Sender<bool>,
    },

    /// Deliver to local members and publish on the bus.
    Broadcast { envelope: Envelope },

    /// Deliver to local members only. Used for envelopes that arrived from
    /// the bus, so they are never published again.
    Relay { envelope: Envelope },

    Members { reply: oneshot::Sender<Vec<User>> },

    Info { reply: oneshot::Sender<RoomInfo> },

    Shutdown,
}

/// A snapshot of room metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub private: bool,
    pub member_count: usize,
}

/// Handle to a running room actor.
///
/// Cheap to clone: an id, a name and an `mpsc::Sender`. The hub keeps one
/// per room and hands out copies.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    id: RoomId,
    name: Arc<str>,
    private: bool,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Adds `client` to the room. Idempotent.
    pub async fn join(&self, client: ClientHandle) -> Result<JoinOutcome, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RoomCommand::Join {
            client,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RoomError::Unavailable(self.id))
    }

    /// Removes a client from the room. Idempotent; returns `false` if it
    /// was not a member.
    pub async fn leave(&self, client_id: ClientId) -> Result<bool, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RoomCommand::Leave {
            client_id,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RoomError::Unavailable(self.id))
    }

    /// Fans `envelope` out to every current member and publishes it on the
    /// room's bus channel.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), RoomError> {
        self.send(RoomCommand::Broadcast { envelope }).await
    }

    /// Fans `envelope` out to every current member without publishing it.
    pub async fn relay(&self, envelope: Envelope) -> Result<(), RoomError> {
        self.send(RoomCommand::Relay { envelope }).await
    }

    /// Returns the sender stubs of the current members, ordered by name.
    pub async fn members(&self) -> Result<Vec<User>, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RoomCommand::Members { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| RoomError::Unavailable(self.id))
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RoomCommand::Info { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| RoomError::Unavailable(self.id))
    }

    /// Tells the room to stop. Commands already queued are dropped.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.send(RoomCommand::Shutdown).await
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| RoomError::Unavailable(self.id))
    }
}

/// The internal room actor state. Runs inside a Tokio task.
struct RoomActor<C> {
    id: RoomId,
    name: Arc<str>,
    private: bool,
    channel: String,
    members: HashMap<ClientId, ClientHandle>,
    codec: C,
    publisher: Option<Publisher>,
    receiver: mpsc::Receiver<RoomCommand>,
}

impl<C: Codec> RoomActor<C> {
    async fn run(mut self) {
        tracing::info!(room_id = %self.id, room = %self.name, "room actor started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RoomCommand::Join { client, reply } => {
                    let outcome = self.handle_join(client);
                    let _ = reply.send(outcome);
                }
                RoomCommand::Leave { client_id, reply } => {
                    let was_member = self.handle_leave(client_id);
                    let _ = reply.send(was_member);
                }
                RoomCommand::Broadcast { envelope } => {
                    self.deliver(envelope, true);
                }
                RoomCommand::Relay { envelope } => {
                    self.deliver(envelope, false);
                }
                RoomCommand::Members { reply } => {
                    let _ = reply.send(self.member_list());
                }
                RoomCommand::Info { reply } => {
                    let _ = reply.send(self.info());
                }
                RoomCommand::Shutdown => {
                    tracing::info!(room_id = %self.id, "room shutting down");
                    break;
                }
            }
        }

        tracing::info!(room_id = %self.id, room = %self.name, "room actor stopped");
    }

    fn handle_join(&mut self, client: ClientHandle) -> JoinOutcome {
        if self.members.contains_key(&client.id()) {
            return JoinOutcome::AlreadyMember;
        }

        // Existing members hear about the newcomer; the newcomer does not.
        if !self.private {
            let notice = Envelope::new(Action::UserJoined, &*self.name)
                .with_sender(client.user())
                .with_text(format!("{} joined the room", client.name()));
            self.deliver(notice, true);
        }

        self.members.insert(client.id(), client.clone());
        tracing::info!(
            room = %self.name,
            client_id = %client.id(),
            members = self.members.len(),
            "client joined"
        );
        JoinOutcome::Joined
    }

    fn handle_leave(&mut self, client_id: ClientId) -> bool {
        let Some(client) = self.members.remove(&client_id) else {
            return false;
        };
        tracing::info!(
            room = %self.name,
            %client_id,
            members = self.members.len(),
            "client left"
        );
        self.deliver(self.left_notice(&client), true);
        true
    }

    /// Fans `envelope` out locally, publishing it when asked. Members that
    /// could not take a frame are evicted, and their departure is announced
    /// the same way.
    fn deliver(&mut self, envelope: Envelope, publish: bool) {
        let mut pending = VecDeque::from([(envelope, publish)]);
        while let Some((envelope, publish)) = pending.pop_front() {
            for evicted in self.fan_out(&envelope) {
                pending.push_back((self.left_notice(&evicted), true));
            }
            if publish {
                self.publish(&envelope);
            }
        }
    }

    /// Queues one encoded copy of `envelope` for every member without
    /// waiting. Returns the members that had to be removed.
    fn fan_out(&mut self, envelope: &Envelope) -> Vec<ClientHandle> {
        let frame: Frame = match self.codec.encode(envelope) {
            Ok(bytes) => Arc::from(bytes),
            Err(e) => {
                tracing::warn!(room = %self.name, error = %e, "dropping unencodable envelope");
                return Vec::new();
            }
        };

        let mut dropped = Vec::new();
        for (id, member) in &self.members {
            match member.try_deliver(Arc::clone(&frame)) {
                Ok(()) => {}
                Err(DeliveryError::Saturated) => {
                    tracing::warn!(
                        room = %self.name,
                        client_id = %id,
                        "member outbound queue full, evicting"
                    );
                    member.kick();
                    dropped.push(*id);
                }
                Err(DeliveryError::Closed) => dropped.push(*id),
            }
        }

        dropped
            .into_iter()
            .filter_map(|id| self.members.remove(&id))
            .collect()
    }

    fn publish(&self, envelope: &Envelope) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(e) = publisher.publish(&self.codec, &self.channel, envelope) {
            tracing::warn!(room = %self.name, error = %e, "bus publish failed");
        }
    }

    fn left_notice(&self, client: &ClientHandle) -> Envelope {
        Envelope::new(Action::UserLeft, &*self.name)
            .with_sender(client.user())
            .with_text(format!("{} left the room", client.name()))
    }

    fn member_list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.members.values().map(ClientHandle::user).collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.to_string(),
            private: self.private,
            member_count: self.members.len(),
        }
    }
}

/// Spawns a new room actor task and returns a handle to communicate with it.
///
/// `publisher` is `None` for single-instance deployments; broadcasts are
/// then delivered locally only.
pub fn spawn_room<C: Codec>(
    spec: RoomSpec,
    config: RoomConfig,
    codec: C,
    publisher: Option<Publisher>,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let name: Arc<str> = Arc::from(spec.name);

    let actor = RoomActor {
        id: spec.id,
        name: Arc::clone(&name),
        private: spec.private,
        channel: room_channel(&name),
        members: HashMap::new(),
        codec,
        publisher,
        receiver: rx,
    };
    tokio::spawn(actor.run());

    RoomHandle {
        id: spec.id,
        name,
        private: spec.private,
        sender: tx,
    }
}
