//! Integration tests for the room actor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_bus::{Bus, BusError, BusFrame, BusMessage, InstanceId, LocalBus, Publisher};
use parley_protocol::{Action, ClientId, Codec, Envelope, JsonCodec, RoomId, User};
use parley_room::{
    ClientHandle, ClientQueue, JoinOutcome, RoomConfig, RoomHandle, RoomSpec, spawn_room,
};
use tokio::sync::mpsc;

/// A bus that refuses every publish.
struct DownBus;

#[async_trait]
impl Bus for DownBus {
    async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<(), BusError> {
        Err(BusError::Closed)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        Err(BusError::Closed)
    }
}

fn public_room(name: &str) -> RoomHandle {
    spawn(name, false, None)
}

fn spawn(name: &str, private: bool, publisher: Option<Publisher>) -> RoomHandle {
    let spec = RoomSpec {
        id: RoomId::new(),
        name: name.to_string(),
        private,
    };
    spawn_room(spec, RoomConfig::default(), JsonCodec, publisher)
}

fn client(name: &str) -> (ClientHandle, ClientQueue) {
    ClientHandle::new(ClientId::new(), name, 16)
}

/// Drains every frame currently queued for a client.
fn drain(queue: &mut ClientQueue) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(frame) = queue.frames.try_recv() {
        out.push(JsonCodec.decode(&frame).expect("frames are valid envelopes"));
    }
    out
}

/// Waits until every command queued before this call has been processed.
async fn settle(room: &RoomHandle) {
    room.info().await.expect("room should be running");
}

#[tokio::test]
async fn test_join_notifies_existing_members_only() {
    let room = public_room("lobby");
    let (alice, mut alice_q) = client("alice");
    let (bob, mut bob_q) = client("bob");

    assert_eq!(room.join(alice.clone()).await.unwrap(), JoinOutcome::Joined);
    assert_eq!(room.join(bob.clone()).await.unwrap(), JoinOutcome::Joined);

    let seen_by_alice = drain(&mut alice_q);
    assert_eq!(seen_by_alice.len(), 1);
    assert_eq!(seen_by_alice[0].action, Action::UserJoined);
    assert_eq!(seen_by_alice[0].target, "lobby");
    assert_eq!(seen_by_alice[0].sender.name, "bob");
    assert_eq!(seen_by_alice[0].message.text, "bob joined the room");

    assert!(drain(&mut bob_q).is_empty(), "joiner must not see its own notice");
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let room = public_room("lobby");
    let (alice, mut alice_q) = client("alice");
    let (bob, _bob_q) = client("bob");

    room.join(alice.clone()).await.unwrap();
    assert_eq!(room.join(bob.clone()).await.unwrap(), JoinOutcome::Joined);
    assert_eq!(room.join(bob.clone()).await.unwrap(), JoinOutcome::AlreadyMember);

    assert_eq!(drain(&mut alice_q).len(), 1, "only the first join is announced");
    assert_eq!(room.info().await.unwrap().member_count, 2);
}

#[tokio::test]
async fn test_leave_notifies_remaining_and_is_idempotent() {
    let room = public_room("lobby");
    let (alice, mut alice_q) = client("alice");
    let (bob, mut bob_q) = client("bob");
    room.join(alice.clone()).await.unwrap();
    room.join(bob.clone()).await.unwrap();
    drain(&mut alice_q);

    assert!(room.leave(bob.id()).await.unwrap());
    assert!(!room.leave(bob.id()).await.unwrap());

    let seen = drain(&mut alice_q);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].action, Action::UserLeft);
    assert_eq!(seen[0].message.text, "bob left the room");
    assert!(drain(&mut bob_q).is_empty());
    assert_eq!(room.members().await.unwrap(), vec![alice.user()]);
}

#[tokio::test]
async fn test_broadcast_after_join_reaches_the_joiner() {
    let room = public_room("lobby");
    let (alice, mut alice_q) = client("alice");

    let msg = Envelope::new(Action::SendMessage, "lobby")
        .with_sender(alice.user())
        .with_text("hi");
    room.join(alice.clone()).await.unwrap();
    room.broadcast(msg.clone()).await.unwrap();
    settle(&room).await;

    assert_eq!(drain(&mut alice_q), vec![msg]);
}

#[tokio::test]
async fn test_broadcast_is_isolated_per_room() {
    let lobby = public_room("lobby");
    let other = public_room("other");
    let (alice, mut alice_q) = client("alice");
    let (bob, mut bob_q) = client("bob");
    lobby.join(alice.clone()).await.unwrap();
    other.join(bob.clone()).await.unwrap();

    lobby
        .broadcast(Envelope::new(Action::SendMessage, "lobby").with_text("hi"))
        .await
        .unwrap();
    settle(&lobby).await;

    assert_eq!(drain(&mut alice_q).len(), 1);
    assert!(drain(&mut bob_q).is_empty());
}

#[tokio::test]
async fn test_saturated_member_is_evicted_without_blocking_others() {
    let room = public_room("lobby");
    let (slow, slow_q) = ClientHandle::new(ClientId::new(), "slow", 1);
    let (fast, mut fast_q) = client("fast");
    room.join(slow.clone()).await.unwrap();
    room.join(fast.clone()).await.unwrap();
    // The slow member's single slot now holds fast's join notice.

    room.broadcast(Envelope::new(Action::SendMessage, "lobby").with_text("one"))
        .await
        .unwrap();
    settle(&room).await;

    let seen: Vec<_> = drain(&mut fast_q);
    assert_eq!(seen[0].message.text, "one");
    assert_eq!(seen[1].action, Action::UserLeft);
    assert_eq!(seen[1].sender.name, "slow");

    assert_eq!(room.members().await.unwrap(), vec![fast.user()]);
    tokio::time::timeout(Duration::from_secs(1), slow_q.kick.notified())
        .await
        .expect("slow member should be kicked");
}

#[tokio::test]
async fn test_private_room_does_not_announce_joins() {
    let room = spawn("private:alice:bob", true, None);
    let (alice, mut alice_q) = client("alice");
    let (bob, _bob_q) = client("bob");
    room.join(alice.clone()).await.unwrap();
    room.join(bob.clone()).await.unwrap();

    assert!(drain(&mut alice_q).is_empty());
    assert!(room.info().await.unwrap().private);
    assert_eq!(room.members().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_members_are_listed_by_name() {
    let room = public_room("lobby");
    let (carol, _c) = client("carol");
    let (alice, _a) = client("alice");
    room.join(carol.clone()).await.unwrap();
    room.join(alice.clone()).await.unwrap();

    let names: Vec<String> = room
        .members()
        .await
        .unwrap()
        .into_iter()
        .map(|u: User| u.name)
        .collect();
    assert_eq!(names, ["alice", "carol"]);
}

#[tokio::test]
async fn test_broadcast_publishes_but_relay_does_not() {
    let bus = LocalBus::new();
    let mut bus_rx = bus.subscribe().await.unwrap();
    let origin = InstanceId::new();
    let room = spawn(
        "lobby",
        false,
        Some(Publisher::new(Arc::new(bus.clone()), origin)),
    );
    let (alice, mut alice_q) = client("alice");
    room.join(alice.clone()).await.unwrap();

    room.relay(Envelope::new(Action::SendMessage, "lobby").with_text("from afar"))
        .await
        .unwrap();
    room.broadcast(Envelope::new(Action::SendMessage, "lobby").with_text("local"))
        .await
        .unwrap();
    settle(&room).await;

    let texts: Vec<String> = drain(&mut alice_q).into_iter().map(|e| e.message.text).collect();
    assert_eq!(texts, ["from afar", "local"]);

    // Alice's own join notice goes out for members on other instances.
    let joined: BusFrame = JsonCodec.decode(&bus_rx.recv().await.unwrap().payload).unwrap();
    assert_eq!(joined.envelope.action, Action::UserJoined);

    let published = bus_rx.recv().await.unwrap();
    assert_eq!(published.channel, "room:lobby");
    let frame: BusFrame = JsonCodec.decode(&published.payload).unwrap();
    assert_eq!(frame.origin, origin);
    assert_eq!(frame.envelope.message.text, "local");
    assert!(bus_rx.try_recv().is_err(), "relay must not be published");
}

#[tokio::test]
async fn test_failing_bus_leaves_local_fan_out_intact() {
    let publisher = Publisher::new(Arc::new(DownBus), InstanceId::new());
    let room = spawn("lobby", false, Some(publisher));
    let (alice, mut alice_q) = client("alice");
    let (bob, mut bob_q) = client("bob");
    room.join(alice.clone()).await.unwrap();
    room.join(bob.clone()).await.unwrap();
    drain(&mut alice_q);

    for text in ["one", "two"] {
        room.broadcast(Envelope::new(Action::SendMessage, "lobby").with_text(text))
            .await
            .unwrap();
    }
    settle(&room).await;

    let texts: Vec<String> = drain(&mut bob_q).into_iter().map(|e| e.message.text).collect();
    assert_eq!(texts, ["one", "two"]);
    assert_eq!(drain(&mut alice_q).len(), 2);
}

#[tokio::test]
async fn test_shutdown_makes_room_unavailable() {
    let room = public_room("lobby");
    room.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(room.info().await.is_err());
}
