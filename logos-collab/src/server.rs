//! WebSocket relay with one room per session.
//!
//! ```text
//! Client A ──┐                         ┌── HistoryLog (bounded, deduped)
//!            ├── ws://host/<session> ──┤
//! Client B ──┘                         └── BroadcastGroup ──► A, B, C (minus sender)
//! ```
//!
//! The relay does not interpret operations. It acknowledges every batch it
//! receives, relays a batch once per batch id, keeps a bounded history
//! for `sync-request`, and fans commands out untouched. Frames it
//! originates carry the nil uuid as sender. A room and its history outlive
//! its connections until it has been idle for `idle_room_ttl`.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Room, RoomFrame, RoomManager};
use crate::protocol::{MessageType, SyncMessage};
use crate::ParticipantId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Batches retained per room for `sync-request` (at least one)
    pub history_capacity: usize,
    /// How long a room with no peers keeps its history
    pub idle_room_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            history_capacity: 4096,
            idle_room_ttl: Duration::from_secs(3600),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub batches_relayed: u64,
    pub duplicate_batches: u64,
    pub history_replies: u64,
}

pub struct SyncServer {
    config: ServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.history_capacity,
        ));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and accept connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        tokio::spawn(Self::sweep_idle_rooms(
            Arc::downgrade(&self.room_manager),
            self.stats.clone(),
            self.config.idle_room_ttl,
        ));

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.room_manager.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Periodically evict idle rooms; stops once the server is dropped.
    async fn sweep_idle_rooms(
        rooms: Weak<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        ttl: Duration,
    ) {
        let period = ttl.clamp(Duration::from_millis(100), Duration::from_secs(60));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(rooms) = rooms.upgrade() else {
                break;
            };
            if rooms.evict_idle(ttl, Instant::now()).await > 0 {
                stats.write().await.active_rooms = rooms.room_count().await;
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let Some(session_id) = session_from_path(&path) else {
            log::warn!("Rejecting {addr}: no session id in path '{path}'");
            stats.write().await.rejected_connections += 1;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        };

        // Membership is per connection; the participant id is only known
        // after the first frame
        let connection_id = Uuid::new_v4();
        let Some((room, mut broadcast_rx)) = rooms
            .join(session_id, connection_id, config.max_peers_per_room)
            .await
        else {
            log::warn!("Rejecting {addr}: room {session_id} is full");
            stats.write().await.rejected_connections += 1;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        };

        log::info!("WebSocket connection from {addr} joined session {session_id}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = rooms.room_count().await;
        }

        let mut peer_id: Option<ParticipantId> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.into(),
                            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        if peer_id.is_none() {
                            peer_id = Some(sync_msg.sender_id);
                            log::info!("Peer {} joined session {session_id}", sync_msg.sender_id);
                        }

                        let replies = Self::route(&room, session_id, &stats, sync_msg, bytes).await;
                        for reply in replies {
                            ws_sender.send(Message::Binary(reply.into())).await?;
                        }
                    }

                    frame = broadcast_rx.recv() => {
                        match frame {
                            Ok(frame) => {
                                if Some(frame.sender_id) == peer_id {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                log::warn!("Peer {peer_id:?} lagged by {missed} frames, sending history");
                                room.broadcast.record_lag(missed);
                                let reply = Self::history_reply(&room, &stats).await?;
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(pid) = peer_id {
            log::info!("Peer {pid} left session {session_id}");
        }
        if rooms.leave(&session_id, &connection_id).await {
            log::info!("Room {session_id} is empty, history kept");
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        result
    }

    /// Handle one frame from a peer; returns frames to send back to it.
    async fn route(
        room: &Room,
        session_id: Uuid,
        stats: &RwLock<ServerStats>,
        msg: SyncMessage,
        bytes: Vec<u8>,
    ) -> Vec<Vec<u8>> {
        let mut replies = Vec::new();
        match msg.msg_type {
            MessageType::Operation => {
                let batch = match msg.batch() {
                    Ok(b) => b,
                    Err(e) => {
                        log::warn!("Malformed batch from {}: {e}", msg.sender_id);
                        return replies;
                    }
                };
                if batch.session_id != session_id {
                    log::warn!(
                        "Batch {} for session {} arrived on session {session_id}",
                        batch.batch_id,
                        batch.session_id
                    );
                    return replies;
                }

                let batch_id = batch.batch_id;
                let fresh = room.history.lock().await.record(batch);
                if fresh {
                    room.broadcast.broadcast_raw(Arc::new(RoomFrame {
                        sender_id: msg.sender_id,
                        bytes,
                    }));
                    stats.write().await.batches_relayed += 1;
                } else {
                    log::debug!("Batch {batch_id} already relayed, acking again");
                    stats.write().await.duplicate_batches += 1;
                }

                // Acked either way so the sender stops retrying
                push_encoded(&mut replies, SyncMessage::ack(Uuid::nil(), batch_id));
            }
            MessageType::Command => {
                room.broadcast.broadcast_raw(Arc::new(RoomFrame {
                    sender_id: msg.sender_id,
                    bytes,
                }));
            }
            MessageType::SyncRequest => match Self::history_reply(room, stats).await {
                Ok(reply) => replies.push(reply),
                Err(e) => log::error!("Failed to build history reply: {e}"),
            },
            MessageType::Heartbeat => {
                push_encoded(&mut replies, SyncMessage::heartbeat(Uuid::nil()));
            }
            MessageType::Ack | MessageType::Sync => {
                log::debug!("Unexpected {:?} from {}", msg.msg_type, msg.sender_id);
            }
        }
        replies
    }

    async fn history_reply(room: &Room, stats: &RwLock<ServerStats>) -> Result<Vec<u8>, BoxError> {
        let batches = room.history.lock().await.snapshot();
        let encoded = SyncMessage::sync(Uuid::nil(), &batches)?.encode()?;
        stats.write().await.history_replies += 1;
        log::debug!("History reply: {} batches, {} bytes", batches.len(), encoded.len());
        Ok(encoded)
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

fn push_encoded(replies: &mut Vec<Vec<u8>>, msg: SyncMessage) {
    match msg.encode() {
        Ok(bytes) => replies.push(bytes),
        Err(e) => log::error!("Failed to encode {:?} reply: {e}", msg.msg_type),
    }
}

/// `/<session uuid>` → session id.
fn session_from_path(path: &str) -> Option<Uuid> {
    let segment = path.trim_matches('/').rsplit('/').next()?;
    Uuid::parse_str(segment).ok()
}
