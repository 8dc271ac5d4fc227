//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real relay and connect real clients, verifying the
//! full pipeline: store change feed → outbound queue → relay → holdback →
//! codec → peer store.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use logos_collab::client::{CommandSender, ReconnectPolicy, SyncClient};
use logos_collab::clock::LogicalClock;
use logos_collab::orchestrator::{SessionState, SyncConfig, SyncEvent};
use logos_collab::protocol::{
    Batch, Envelope, MessageType, OperationKind, ProtocolError, SyncMessage,
};
use logos_collab::server::{ServerConfig, SyncServer};
use logos_core::{DocumentStore, MemoryStore, Model, ModelRegistry, Origin, Props};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        history_capacity: 128,
        ..ServerConfig::default()
    }
}

async fn start_test_server() -> (Arc<SyncServer>, String) {
    start_test_server_with(|_| {}).await
}

/// Serve on an already bound listener so there is no startup race.
async fn start_test_server_with(tune: impl FnOnce(&mut ServerConfig)) -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = test_config(port);
    tune(&mut config);
    let server = Arc::new(SyncServer::new(config));
    let relay = server.clone();
    tokio::spawn(async move {
        relay.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

/// A running client and the handles a test needs.
struct Peer {
    store: Arc<MemoryStore>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    commands: CommandSender,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ProtocolError>>,
}

impl Peer {
    fn spawn(url: &str, session: Uuid, policy: ReconnectPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mut client = SyncClient::new(
            Uuid::new_v4(),
            session,
            url,
            store.clone(),
            Arc::new(ModelRegistry::with_defaults()),
            SyncConfig::default(),
        )
        .with_reconnect_policy(policy);
        let events = client.take_event_rx().unwrap();
        let commands = client.commands();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(client.run(rx));
        Self {
            store,
            events,
            commands,
            shutdown: Some(tx),
            handle,
        }
    }

    /// Spawn and wait until the history handshake completes.
    async fn join(url: &str, session: Uuid) -> Self {
        let mut peer = Self::spawn(url, session, ReconnectPolicy::default());
        peer.wait_for(|e| *e == SyncEvent::StateChanged(SessionState::Live))
            .await;
        peer
    }

    async fn wait_for(&mut self, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        let events = &mut self.events;
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for sync event")
    }

    async fn stop(mut self) -> Result<(), ProtocolError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(WAIT, self.handle)
            .await
            .expect("client did not stop")
            .unwrap()
    }
}

/// Poll until `check` holds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn x_of(store: &MemoryStore, id: Uuid) -> Option<f64> {
    store
        .get_model_by_id(id)
        .and_then(|m| m.prop("x").and_then(|v| v.as_f64()))
}

async fn raw_connect(url: &str, session: Uuid) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("{url}/{session}"))
        .await
        .unwrap();
    ws
}

async fn send_msg(ws: &mut Ws, msg: &SyncMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn next_msg(ws: &mut Ws) -> SyncMessage {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return SyncMessage::decode(&data).unwrap(),
                Some(Ok(Message::Text(text))) => {
                    return SyncMessage::decode(text.as_bytes()).unwrap()
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Round-trip a heartbeat so the relay has registered this socket.
async fn handshake(ws: &mut Ws, participant: Uuid) {
    send_msg(ws, &SyncMessage::heartbeat(participant)).await;
    let reply = next_msg(ws).await;
    assert_eq!(reply.msg_type, MessageType::Heartbeat);
    assert_eq!(reply.sender_id, Uuid::nil());
}

fn create_batch(origin: Uuid, session: Uuid, seq: u64) -> Batch {
    let model = Model::rect(seq as f64, 0.0, 10.0, 10.0);
    let op = Envelope::new(
        origin,
        session,
        LogicalClock::from([(origin, seq)]),
        OperationKind::Create,
        json!({ "modelType": "rect", "data": model }),
    );
    Batch::new(origin, session, vec![op])
}

/// Send a batch and wait for the relay's ack.
async fn publish(ws: &mut Ws, batch: &Batch) {
    send_msg(ws, &SyncMessage::operation(batch.origin_id, batch).unwrap()).await;
    loop {
        let msg = next_msg(ws).await;
        if msg.msg_type == MessageType::Ack {
            assert_eq!(msg.ack_data().unwrap().batch_id, batch.batch_id);
            return;
        }
    }
}

async fn wait_for_no_connections(server: &SyncServer) {
    let deadline = Instant::now() + WAIT;
    while server.stats().await.active_connections > 0 {
        assert!(Instant::now() < deadline, "connections never closed");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_server_accepts_session_connections() {
    let (server, url) = start_test_server().await;
    let session = Uuid::new_v4();

    let mut ws = raw_connect(&url, session).await;
    handshake(&mut ws, Uuid::new_v4()).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_rooms, 1);
}

#[tokio::test]
async fn test_server_rejects_path_without_session() {
    let (server, url) = start_test_server().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/not-a-session"))
        .await
        .unwrap();
    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay should close a socket without a session");

    let stats = server.stats().await;
    assert_eq!(stats.rejected_connections, 1);
    assert_eq!(server.room_manager().room_count().await, 0);
}

#[tokio::test]
async fn test_client_goes_live_and_stops() {
    let (_server, url) = start_test_server().await;
    let peer = Peer::join(&url, Uuid::new_v4()).await;
    assert!(peer.stop().await.is_ok());
}

#[tokio::test]
async fn test_create_update_delete_propagate() {
    let (_server, url) = start_test_server().await;
    let session = Uuid::new_v4();
    let mut alice = Peer::join(&url, session).await;
    let mut bob = Peer::join(&url, session).await;

    let rect = Model::rect(1.0, 2.0, 30.0, 40.0);
    let id = rect.id;
    alice.store.create_model(rect, Origin::Local).unwrap();
    eventually("bob to see the rect", || x_of(&bob.store, id) == Some(1.0)).await;
    assert_eq!(bob.store.get_model_by_id(id).unwrap().model_type, "rect");

    let mut updates = Props::new();
    updates.insert("x".into(), json!(42.0));
    alice.store.update_model(id, updates, Origin::Local).unwrap();
    eventually("bob to see the move", || x_of(&bob.store, id) == Some(42.0)).await;

    bob.store.delete_model(id, Origin::Local).unwrap();
    eventually("alice to see the delete", || {
        alice.store.get_model_by_id(id).is_none()
    })
    .await;

    let applied = alice
        .wait_for(|e| {
            matches!(
                e,
                SyncEvent::RemoteApplied {
                    kind: OperationKind::Delete,
                    ..
                }
            )
        })
        .await;
    assert!(matches!(applied, SyncEvent::RemoteApplied { .. }));
    let created = bob
        .wait_for(|e| {
            matches!(
                e,
                SyncEvent::RemoteApplied {
                    kind: OperationKind::Create,
                    ..
                }
            )
        })
        .await;
    assert!(matches!(created, SyncEvent::RemoteApplied { .. }));

    // Remote applications are not echoed back as new operations
    sleep(Duration::from_millis(200)).await;
    assert!(alice.store.is_empty());
    assert!(bob.store.is_empty());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (_server, url) = start_test_server().await;
    let alice = Peer::join(&url, Uuid::new_v4()).await;
    let bob = Peer::join(&url, Uuid::new_v4()).await;

    alice
        .store
        .create_model(Model::rect(0.0, 0.0, 1.0, 1.0), Origin::Local)
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(bob.store.is_empty());
}

#[tokio::test]
async fn test_late_joiner_receives_history() {
    let (server, url) = start_test_server().await;
    let session = Uuid::new_v4();
    let alice = Peer::join(&url, session).await;

    let models: Vec<Model> = (0..3)
        .map(|i| Model::rect(i as f64, 0.0, 5.0, 5.0))
        .collect();
    for model in &models {
        alice.store.create_model(model.clone(), Origin::Local).unwrap();
    }

    // Wait until the relay has retained every operation
    let deadline = Instant::now() + WAIT;
    loop {
        let room = server.room_manager().get(&session).await.unwrap();
        let retained: usize = room.history.lock().await.snapshot().iter().map(Batch::len).sum();
        if retained == models.len() {
            break;
        }
        assert!(Instant::now() < deadline, "relay never retained the ops");
        sleep(Duration::from_millis(20)).await;
    }

    let bob = Peer::join(&url, session).await;
    // History is applied before the session reports live
    for model in &models {
        assert_eq!(x_of(&bob.store, model.id), model.prop("x").and_then(|v| v.as_f64()));
    }
    assert!(server.stats().await.history_replies >= 2);
}

#[tokio::test]
async fn test_commands_reach_peers() {
    let (_server, url) = start_test_server().await;
    let session = Uuid::new_v4();
    let alice = Peer::join(&url, session).await;
    let mut bob = Peer::join(&url, session).await;

    let sent = alice
        .commands
        .send("stroke-preview", json!({ "points": [[0, 0], [4, 4]] }))
        .unwrap();
    assert!(sent);

    let event = bob
        .wait_for(|e| matches!(e, SyncEvent::Command { .. }))
        .await;
    match event {
        SyncEvent::Command { command, .. } => {
            assert_eq!(command.command_type, "stroke-preview");
            assert_eq!(command.params["points"][1][0], 4);
        }
        other => panic!("expected command, got {other:?}"),
    }
    // Commands never touch the document
    assert!(bob.store.is_empty());
}

#[tokio::test]
async fn test_relay_acks_and_suppresses_duplicates() {
    let (server, url) = start_test_server().await;
    let session = Uuid::new_v4();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let mut ws_alice = raw_connect(&url, session).await;
    let mut ws_bob = raw_connect(&url, session).await;
    handshake(&mut ws_alice, alice).await;
    handshake(&mut ws_bob, bob).await;

    let batch = create_batch(alice, session, 1);
    let frame = SyncMessage::operation(alice, &batch).unwrap();
    send_msg(&mut ws_alice, &frame).await;
    send_msg(&mut ws_alice, &frame).await;

    // Both copies are acknowledged so the sender can stop retrying
    for _ in 0..2 {
        let ack = next_msg(&mut ws_alice).await;
        assert_eq!(ack.msg_type, MessageType::Ack);
        assert_eq!(ack.ack_data().unwrap().batch_id, batch.batch_id);
    }

    let relayed = next_msg(&mut ws_bob).await;
    assert_eq!(relayed.msg_type, MessageType::Operation);
    assert_eq!(relayed.sender_id, alice);
    assert_eq!(relayed.batch().unwrap(), batch);

    send_msg(&mut ws_bob, &SyncMessage::sync_request(bob, session)).await;
    let reply = loop {
        let msg = next_msg(&mut ws_bob).await;
        assert_ne!(msg.msg_type, MessageType::Operation, "duplicate relayed");
        if msg.msg_type == MessageType::Sync {
            break msg;
        }
    };
    assert_eq!(reply.history().unwrap().batches, vec![batch]);

    // Nothing else is on its way
    assert!(timeout(Duration::from_millis(200), ws_bob.next())
        .await
        .is_err());

    let stats = server.stats().await;
    assert_eq!(stats.batches_relayed, 1);
    assert_eq!(stats.duplicate_batches, 1);
}

#[tokio::test]
async fn test_operation_not_echoed_to_sender() {
    let (_server, url) = start_test_server().await;
    let session = Uuid::new_v4();
    let alice = Uuid::new_v4();

    let mut ws = raw_connect(&url, session).await;
    handshake(&mut ws, alice).await;

    let batch = create_batch(alice, session, 1);
    send_msg(&mut ws, &SyncMessage::operation(alice, &batch).unwrap()).await;
    assert_eq!(next_msg(&mut ws).await.msg_type, MessageType::Ack);
    assert!(timeout(Duration::from_millis(200), ws.next()).await.is_err());
}

#[tokio::test]
async fn test_client_connects_once_relay_starts() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let mut peer = Peer::spawn(
        &url,
        Uuid::new_v4(),
        ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_attempts: None,
        },
    );

    peer.wait_for(|e| *e == SyncEvent::Disconnected).await;

    // Edits made while offline are sent once the session is live
    let offline = Model::rect(7.0, 7.0, 1.0, 1.0);
    peer.store.create_model(offline, Origin::Local).unwrap();

    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();
    let server = Arc::new(SyncServer::new(test_config(port)));
    let relay = server.clone();
    tokio::spawn(async move {
        relay.serve(listener).await.unwrap();
    });

    peer.wait_for(|e| *e == SyncEvent::StateChanged(SessionState::Live))
        .await;

    let deadline = Instant::now() + WAIT;
    while server.stats().await.batches_relayed < 1 {
        assert!(Instant::now() < deadline, "offline edit never reached the relay");
        sleep(Duration::from_millis(20)).await;
    }
    assert!(peer.stop().await.is_ok());
}

#[tokio::test]
async fn test_history_survives_empty_room() {
    let (server, url) = start_test_server().await;
    let session = Uuid::new_v4();
    let alice = Uuid::new_v4();

    // Alice edits alone and leaves
    let mut ws = raw_connect(&url, session).await;
    handshake(&mut ws, alice).await;
    publish(&mut ws, &create_batch(alice, session, 1)).await;
    ws.close(None).await.unwrap();
    wait_for_no_connections(&server).await;
    assert_eq!(server.room_manager().room_count().await, 1);

    let bob = Peer::join(&url, session).await;
    assert_eq!(bob.store.len(), 1);

    // Alice reconnects and continues at the next sequence
    let mut ws = raw_connect(&url, session).await;
    handshake(&mut ws, alice).await;
    publish(&mut ws, &create_batch(alice, session, 2)).await;
    eventually("bob to see alice's second edit", || bob.store.len() == 2).await;
    assert!(bob.stop().await.is_ok());
}

#[tokio::test]
async fn test_late_joiner_skips_evicted_history() {
    let (_server, url) = start_test_server_with(|c| c.history_capacity = 2).await;
    let session = Uuid::new_v4();
    let alice = Uuid::new_v4();

    let mut ws = raw_connect(&url, session).await;
    handshake(&mut ws, alice).await;
    for seq in 1..=4 {
        publish(&mut ws, &create_batch(alice, session, seq)).await;
    }

    // Only the last two batches are left for Bob
    let mut bob = Peer::spawn(&url, session, ReconnectPolicy::default());
    let lost = bob
        .wait_for(|e| matches!(e, SyncEvent::ResyncRequired { .. }))
        .await;
    assert_eq!(lost, SyncEvent::ResyncRequired { dropped: 2 });
    bob.wait_for(|e| *e == SyncEvent::StateChanged(SessionState::Live))
        .await;
    assert_eq!(bob.store.len(), 2);

    publish(&mut ws, &create_batch(alice, session, 5)).await;
    eventually("bob to apply the live edit", || bob.store.len() == 3).await;

    // No resync loop
    assert!(timeout(
        Duration::from_millis(200),
        bob.wait_for(|e| matches!(e, SyncEvent::ResyncRequired { .. }))
    )
    .await
    .is_err());
    assert!(bob.stop().await.is_ok());
}

#[tokio::test]
async fn test_idle_room_is_evicted_after_ttl() {
    let (server, url) = start_test_server_with(|c| c.idle_room_ttl = Duration::from_millis(50)).await;
    let session = Uuid::new_v4();
    let alice = Uuid::new_v4();

    let mut ws = raw_connect(&url, session).await;
    handshake(&mut ws, alice).await;
    publish(&mut ws, &create_batch(alice, session, 1)).await;
    ws.close(None).await.unwrap();
    wait_for_no_connections(&server).await;

    let deadline = Instant::now() + WAIT;
    while server.room_manager().room_count().await > 0 {
        assert!(Instant::now() < deadline, "idle room never evicted");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.stats().await.active_rooms, 0);
}
