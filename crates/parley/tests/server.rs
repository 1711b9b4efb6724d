//! End-to-end tests: real WebSocket clients against running servers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley::PRIVATE_ROOM_PREFIX;
use parley::prelude::*;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// =========================================================================
// Helpers
// =========================================================================

async fn start(config: ServerConfig, bus: Option<Arc<dyn Bus>>) -> (String, Hub) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..config
    };
    let mut builder = ChatServer::builder().config(config);
    if let Some(bus) = bus {
        builder = builder.bus(bus);
    }
    let server = builder.build().await.expect("server should start");
    let addr = server.local_addr().unwrap().to_string();
    let hub = server.hub().clone();
    tokio::spawn(server.run());
    (addr, hub)
}

async fn start_default() -> (String, Hub) {
    start(ServerConfig::default(), None).await
}

/// A chat client that splits batched frames back into envelopes.
struct TestClient {
    ws: ClientWs,
    pending: VecDeque<Envelope>,
}

impl TestClient {
    async fn connect(addr: &str, name: &str) -> Self {
        let url = format!("ws://{addr}/ws?name={name}");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("client should connect");
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, value: serde_json::Value) {
        self.ws
            .send(Message::text(value.to_string()))
            .await
            .expect("send should succeed");
    }

    /// Next envelope, or `None` if nothing arrives within `wait` or the
    /// server closed the connection.
    async fn next_within(&mut self, wait: Duration) -> Option<Envelope> {
        if let Some(envelope) = self.pending.pop_front() {
            return Some(envelope);
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match msg {
                Ok(Message::Text(text)) => {
                    for line in text.as_str().split('\n') {
                        let envelope: Envelope =
                            serde_json::from_str(line).expect("server sends envelopes");
                        self.pending.push_back(envelope);
                    }
                    return self.pending.pop_front();
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Skips frames until one with `action` arrives.
    async fn expect(&mut self, action: Action) -> Envelope {
        loop {
            let envelope = self
                .next_within(Duration::from_secs(2))
                .await
                .unwrap_or_else(|| panic!("expected {action}"));
            if envelope.action == action {
                return envelope;
            }
        }
    }

    /// Everything that arrives within `wait`.
    async fn collect(&mut self, wait: Duration) -> Vec<Envelope> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        while let Some(envelope) = self
            .next_within(deadline.saturating_duration_since(tokio::time::Instant::now()))
            .await
        {
            out.push(envelope);
        }
        out
    }

    async fn join(&mut self, room: &str) -> Envelope {
        self.send(json!({"action": "join-room", "target": room})).await;
        self.expect(Action::RoomJoined).await
    }

    async fn say(&mut self, room: &str, text: &str) {
        self.send(json!({
            "action": "send-message",
            "target": room,
            "message": {"text": text}
        }))
        .await;
    }
}

fn count_text(envelopes: &[Envelope], text: &str) -> usize {
    envelopes
        .iter()
        .filter(|e| e.action == Action::SendMessage && e.message.text == text)
        .count()
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_lobby_message_reaches_other_member_once() {
    let (addr, _hub) = start_default().await;
    let mut alice = TestClient::connect(&addr, "alice").await;
    let mut bob = TestClient::connect(&addr, "bob").await;

    let ack = alice.join("lobby").await;
    assert_eq!(ack.target, "lobby");
    bob.join("lobby").await;

    let notice = alice.expect(Action::UserJoined).await;
    let notice = if notice.target.is_empty() {
        // bob coming online; the room notice follows
        alice.expect(Action::UserJoined).await
    } else {
        notice
    };
    assert_eq!(notice.target, "lobby");
    assert_eq!(notice.sender.name, "bob");

    alice.say("lobby", "hi").await;

    let seen = bob.collect(Duration::from_millis(300)).await;
    assert_eq!(count_text(&seen, "hi"), 1);
    let hi = seen
        .iter()
        .find(|e| e.message.text == "hi")
        .expect("hi delivered");
    assert_eq!(hi.sender.name, "alice");
    assert!(hi.sender.id.is_some());
}

#[tokio::test]
async fn test_legacy_join_chat_alias_is_accepted() {
    let (addr, _hub) = start_default().await;
    let mut alice = TestClient::connect(&addr, "alice").await;

    alice
        .send(json!({"action": "join-chat", "message": {"text": "lobby"}}))
        .await;
    let ack = alice.expect(Action::RoomJoined).await;
    assert_eq!(ack.target, "lobby");
}

#[tokio::test]
async fn test_private_join_with_offline_target_is_silent() {
    let (addr, hub) = start_default().await;
    let mut alice = TestClient::connect(&addr, "alice").await;

    alice
        .send(json!({"action": "join-room-private", "target": "bob"}))
        .await;

    assert!(alice.collect(Duration::from_millis(200)).await.is_empty());
    assert_eq!(hub.room_count().await, 0);
}

#[tokio::test]
async fn test_private_room_between_two_clients() {
    let (addr, _hub) = start_default().await;
    let mut alice = TestClient::connect(&addr, "alice").await;
    let mut bob = TestClient::connect(&addr, "bob").await;

    alice
        .send(json!({"action": "join-room-private", "target": "bob"}))
        .await;
    let ack = bob.expect(Action::RoomJoined).await;
    assert!(ack.target.starts_with(PRIVATE_ROOM_PREFIX));
    let room = ack.target;
    assert_eq!(alice.expect(Action::RoomJoined).await.target, room);

    bob.say(&room, "just us").await;
    let whisper = alice.expect(Action::SendMessage).await;
    assert_eq!(whisper.message.text, "just us");
}

#[tokio::test]
async fn test_unknown_action_returns_error_frame() {
    let (addr, _hub) = start_default().await;
    let mut alice = TestClient::connect(&addr, "alice").await;

    alice.send(json!({"action": "teleport", "target": "moon"})).await;

    let error = alice.expect(Action::Error).await;
    assert_eq!(error.target, "teleport");
    assert_eq!(error.message.text, "unknown action");

    // The connection survives.
    alice.join("lobby").await;
}

#[tokio::test]
async fn test_upgrade_without_name_is_refused() {
    let (addr, hub) = start_default().await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;

    assert!(result.is_err());
    assert_eq!(hub.client_count().await, 0);
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let (addr, hub) = start_default().await;
    let mut alice = TestClient::connect(&addr, "alice").await;
    let mut carol = TestClient::connect(&addr, "carol").await;
    alice.join("lobby").await;
    carol.join("lobby").await;

    carol.ws.send(Message::text("{not json".to_string())).await.unwrap();

    let left = alice.expect(Action::UserLeft).await;
    assert_eq!(left.sender.name, "carol");
    assert!(carol.collect(Duration::from_millis(300)).await.iter().all(|e| {
        e.action != Action::SendMessage
    }));
    assert_eq!(hub.client_count().await, 1);

    alice.say("lobby", "still here").await;
    let echo = alice.expect(Action::SendMessage).await;
    assert_eq!(echo.message.text, "still here");
}

#[tokio::test]
async fn test_disconnect_leaves_rooms() {
    let (addr, hub) = start_default().await;
    let mut alice = TestClient::connect(&addr, "alice").await;
    let mut bob = TestClient::connect(&addr, "bob").await;
    alice.join("lobby").await;
    bob.join("lobby").await;

    bob.ws.close(None).await.unwrap();

    let left = alice.expect(Action::UserLeft).await;
    assert_eq!(left.target, "lobby");
    assert_eq!(left.message.text, "bob left the room");
    let room = hub.find_room_by_name("lobby").await.unwrap();
    assert_eq!(room.members().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_heartbeat_pings_the_client() {
    let config = ServerConfig {
        heartbeat_interval_ms: 50,
        read_timeout_ms: 1_000,
        ..ServerConfig::default()
    };
    let (addr, _hub) = start(config, None).await;
    let mut alice = TestClient::connect(&addr, "alice").await;

    let ping = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match alice.ws.next().await {
                Some(Ok(Message::Ping(_))) => return true,
                Some(Ok(_)) => continue,
                _ => return false,
            }
        }
    })
    .await
    .expect("ping should arrive");
    assert!(ping);
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_read_deadline() {
    let config = ServerConfig {
        heartbeat_interval_ms: 100,
        read_timeout_ms: 300,
        ..ServerConfig::default()
    };
    let (addr, hub) = start(config, None).await;
    // Never polled, so never answers pings.
    let _silent = TestClient::connect(&addr, "silent").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.client_count().await, 1);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(hub.client_count().await, 0);
}

#[tokio::test]
async fn test_message_crosses_instances_without_duplication() {
    let bus = LocalBus::new();
    let (addr_one, _hub_one) = start(ServerConfig::default(), Some(Arc::new(bus.clone()))).await;
    let (addr_two, hub_two) = start(ServerConfig::default(), Some(Arc::new(bus.clone()))).await;

    let mut alice = TestClient::connect(&addr_one, "alice").await;
    let mut bob = TestClient::connect(&addr_two, "bob").await;
    alice.join("lobby").await;
    bob.join("lobby").await;

    alice.say("lobby", "across").await;

    let seen_by_bob = bob.collect(Duration::from_millis(400)).await;
    assert_eq!(count_text(&seen_by_bob, "across"), 1);
    let seen_by_alice = alice.collect(Duration::from_millis(200)).await;
    assert_eq!(count_text(&seen_by_alice, "across"), 1);

    let room = hub_two.find_room_by_name("lobby").await.unwrap();
    assert_eq!(room.members().await.unwrap().len(), 1, "remote members stay remote");
}
