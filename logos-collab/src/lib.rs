//! # logos-collab: Operation sync engine for Logos
//!
//! Replicates document edits between clients as causally ordered
//! operations. No central sequencer: every participant carries a vector
//! clock, and a relay only fans frames out, acknowledges them, and keeps a
//! bounded history for late joiners.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   WebSocket    ┌─────────────────┐
//! │ SyncClient                   │ ◄────────────► │ SyncServer      │
//! │  └─ SyncOrchestrator         │   JSON frames  │ (relay)         │
//! │      ├─ LogicalClock         │                │  ├─ HistoryLog  │
//! │      ├─ HoldbackBuffer       │                │  └─ Broadcast-  │
//! │      ├─ OutboundQueue        │                │     Group       │
//! │      └─ CodecSet             │                └─────────────────┘
//! └──────────────┬───────────────┘
//!                │ origin-tagged mutations / change feed
//!         ┌──────┴──────┐
//!         │ DocumentStore│  (logos-core)
//!         └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: vector clock and the causal-readiness test
//! - [`holdback`]: remote operations waiting for their dependencies
//! - [`queue`]: outbound batching, backpressure, retry, dead-letter
//! - [`codec`]: create/update/delete change events ⇄ wire payloads
//! - [`orchestrator`]: per-session state machine and async driver
//! - [`protocol`]: JSON wire protocol
//! - [`transport`]: send contract and the channel-backed transport
//! - [`client`]: WebSocket client with reconnect
//! - [`broadcast`], [`history`], [`server`]: the relay

pub mod broadcast;
pub mod client;
pub mod clock;
pub mod codec;
pub mod history;
pub mod holdback;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transport;

/// Identifies one replica in a session.
pub type ParticipantId = uuid::Uuid;

pub use broadcast::{BroadcastGroup, BroadcastStats, Room, RoomFrame, RoomManager};
pub use client::{connect_websocket, CommandSender, ReconnectPolicy, SyncClient};
pub use clock::LogicalClock;
pub use codec::{
    Applied, CodecError, CodecSet, CreateCodec, DeleteCodec, OperationCodec, UpdateCodec,
};
pub use history::HistoryLog;
pub use holdback::HoldbackBuffer;
pub use orchestrator::{RunExit, SessionState, SyncConfig, SyncError, SyncEvent, SyncOrchestrator};
pub use protocol::{
    Ack, Batch, Command, Envelope, MessageType, OperationKind, ProtocolError, SyncHistory,
    SyncMessage, SyncRequest,
};
pub use queue::{
    DeliveryHandler, FlushOutcome, InflightRecord, OutboundQueue, QueueConfig, QueueStats,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use transport::{ChannelTransport, Transport};
