//! JSON wire protocol for operation sync.
//!
//! Every frame is a [`SyncMessage`]:
//! ```text
//! { "id": <uuid>, "senderId": <uuid>, "type": <kind>, "data": <kind-specific> }
//! ```
//!
//! | type           | data                         | path                        |
//! |----------------|------------------------------|-----------------------------|
//! | `operation`    | [`Batch`] of [`Envelope`]s   | holdback → causal delivery  |
//! | `command`      | [`Command`]                  | applied immediately         |
//! | `ack`          | [`Ack`]                      | outbound queue              |
//! | `heartbeat`    | none                         | ignored by the engine       |
//! | `sync-request` | [`SyncRequest`]              | relay                       |
//! | `sync`         | [`SyncHistory`]              | holdback, then go live      |
//!
//! Frames sent by the relay itself use the nil uuid as `senderId`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::LogicalClock;
use crate::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Operation,
    Command,
    Ack,
    Heartbeat,
    SyncRequest,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// One durable operation, immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    op_id: Uuid,
    origin_id: ParticipantId,
    session_id: Uuid,
    /// Origin's clock at emission, already incremented for this op
    clock: LogicalClock,
    kind: OperationKind,
    payload: Value,
    /// Origin's own clock coordinate, 1-based
    sequence: u64,
}

impl Envelope {
    pub fn new(
        origin_id: ParticipantId,
        session_id: Uuid,
        clock: LogicalClock,
        kind: OperationKind,
        payload: Value,
    ) -> Self {
        let sequence = clock.get(&origin_id);
        Self {
            op_id: Uuid::new_v4(),
            origin_id,
            session_id,
            clock,
            kind,
            payload,
            sequence,
        }
    }

    pub fn op_id(&self) -> Uuid {
        self.op_id
    }

    pub fn origin_id(&self) -> ParticipantId {
        self.origin_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Size of this envelope's JSON encoding.
    pub fn encoded_len(&self) -> Result<usize, ProtocolError> {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Unit of transmission, acknowledgment and retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: Uuid,
    pub origin_id: ParticipantId,
    pub session_id: Uuid,
    pub operations: Vec<Envelope>,
}

impl Batch {
    pub fn new(origin_id: ParticipantId, session_id: Uuid, operations: Vec<Envelope>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            origin_id,
            session_id,
            operations,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Ephemeral interaction broadcast (live stroke preview, drag ghost…).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub batch_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub session_id: Uuid,
}

/// Ordered operation history retained by the relay.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistory {
    pub batches: Vec<Batch>,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub id: Uuid,
    pub sender_id: ParticipantId,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl SyncMessage {
    fn with_data<T: Serialize>(
        sender_id: ParticipantId,
        msg_type: MessageType,
        data: &T,
    ) -> Result<Self, ProtocolError> {
        let data =
            serde_json::to_value(data).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            sender_id,
            msg_type,
            data,
        })
    }

    /// Create an operation message carrying one batch.
    pub fn operation(sender_id: ParticipantId, batch: &Batch) -> Result<Self, ProtocolError> {
        Self::with_data(sender_id, MessageType::Operation, batch)
    }

    /// Create an ephemeral command message.
    pub fn command(
        sender_id: ParticipantId,
        command_type: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            msg_type: MessageType::Command,
            data: serde_json::json!({
                "commandType": command_type.into(),
                "params": params,
            }),
        }
    }

    /// Create an acknowledgment for a received batch.
    pub fn ack(sender_id: ParticipantId, batch_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            msg_type: MessageType::Ack,
            data: serde_json::json!({ "batchId": batch_id }),
        }
    }

    pub fn heartbeat(sender_id: ParticipantId) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            msg_type: MessageType::Heartbeat,
            data: Value::Null,
        }
    }

    /// Ask the relay for the retained history of a session.
    pub fn sync_request(sender_id: ParticipantId, session_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            msg_type: MessageType::SyncRequest,
            data: serde_json::json!({ "sessionId": session_id }),
        }
    }

    /// Relay reply to a sync request.
    pub fn sync(sender_id: ParticipantId, batches: &[Batch]) -> Result<Self, ProtocolError> {
        Self::with_data(
            sender_id,
            MessageType::Sync,
            &serde_json::json!({ "batches": batches }),
        )
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse operation payload.
    pub fn batch(&self) -> Result<Batch, ProtocolError> {
        self.parse(MessageType::Operation)
    }

    /// Parse command payload.
    pub fn command_data(&self) -> Result<Command, ProtocolError> {
        self.parse(MessageType::Command)
    }

    /// Parse ack payload.
    pub fn ack_data(&self) -> Result<Ack, ProtocolError> {
        self.parse(MessageType::Ack)
    }

    pub fn sync_request_data(&self) -> Result<SyncRequest, ProtocolError> {
        self.parse(MessageType::SyncRequest)
    }

    pub fn history(&self) -> Result<SyncHistory, ProtocolError> {
        self.parse(MessageType::Sync)
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: expected {expected:?}, found {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}
