//! Fan-out broadcast to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind sees `Lagged` and is resynced
//! from the room history by the server.
//!
//! Reference: Patterson & Hennessy, Section 6.4, "Interconnection Networks"

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::history::HistoryLog;
use crate::protocol::{ProtocolError, SyncMessage};
use crate::ParticipantId;

/// An encoded frame and the peer it came from (so it is not echoed back).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomFrame {
    pub sender_id: ParticipantId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The broadcast channel for one session room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomFrame>>,
    /// One id per connection
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per peer before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<RoomFrame>> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and broadcast a message. Returns the number of receivers.
    pub fn broadcast(
        &self,
        sender_id: ParticipantId,
        msg: &SyncMessage,
    ) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(RoomFrame { sender_id, bytes })))
    }

    /// Broadcast an already encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<RoomFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count frames a lagging receiver missed.
    pub fn record_lag(&self, missed: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One session: its broadcast group and retained history.
///
/// A room outlives its connections so that history survives a moment with
/// nobody connected; [`RoomManager::evict_idle`] reclaims it later.
pub struct Room {
    pub broadcast: BroadcastGroup,
    pub history: Mutex<HistoryLog>,
    /// When the last peer left; `None` while anyone is connected
    idle_since: Mutex<Option<Instant>>,
}

impl Room {
    pub fn new(broadcast_capacity: usize, history_capacity: usize) -> Self {
        Self {
            broadcast: BroadcastGroup::new(broadcast_capacity),
            history: Mutex::new(HistoryLog::new(history_capacity)),
            idle_since: Mutex::new(Some(Instant::now())),
        }
    }

    pub async fn idle_since(&self) -> Option<Instant> {
        *self.idle_since.lock().await
    }
}

/// Maps session ids to rooms so sessions stay isolated.
///
/// Membership changes and eviction all happen under the `rooms` write lock,
/// so a joining peer can never land in a room that is being evicted.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    broadcast_capacity: usize,
    history_capacity: usize,
}

impl RoomManager {
    pub fn new(broadcast_capacity: usize, history_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            history_capacity,
        }
    }

    /// Register a connection in the session's room, creating the room if
    /// needed. `None` when the room already has `max_peers` peers.
    pub async fn join(
        &self,
        session_id: Uuid,
        connection_id: Uuid,
        max_peers: usize,
    ) -> Option<(Arc<Room>, broadcast::Receiver<Arc<RoomFrame>>)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(session_id)
            .or_insert_with(|| {
                log::info!("Room {session_id} created");
                Arc::new(Room::new(self.broadcast_capacity, self.history_capacity))
            })
            .clone();

        if room.broadcast.peer_count().await >= max_peers {
            return None;
        }
        let rx = room.broadcast.add_peer(connection_id).await;
        *room.idle_since.lock().await = None;
        Some((room, rx))
    }

    /// Unregister a connection. The room and its history stay until evicted.
    /// Returns `true` if the room is now empty.
    pub async fn leave(&self, session_id: &Uuid, connection_id: &Uuid) -> bool {
        let rooms = self.rooms.write().await;
        let Some(room) = rooms.get(session_id) else {
            return false;
        };
        room.broadcast.remove_peer(connection_id).await;
        if room.broadcast.peer_count().await > 0 {
            return false;
        }
        *room.idle_since.lock().await = Some(Instant::now());
        true
    }

    /// Drop rooms that have had no peers for at least `ttl`.
    pub async fn evict_idle(&self, ttl: Duration, now: Instant) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut expired = Vec::new();
        for (session_id, room) in rooms.iter() {
            if room.broadcast.peer_count().await > 0 {
                continue;
            }
            let idle = room.idle_since().await;
            if idle.is_some_and(|since| now.saturating_duration_since(since) >= ttl) {
                expired.push(*session_id);
            }
        }
        for session_id in &expired {
            rooms.remove(session_id);
            log::info!("Room {session_id} evicted after {ttl:?} idle");
        }
        expired.len()
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(session_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
