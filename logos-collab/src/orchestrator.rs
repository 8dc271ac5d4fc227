//! Per-session sync orchestrator.
//!
//! Wires the document store, the codecs, the logical clock, the holdback
//! buffer and the outbound queue together:
//!
//! ```text
//! local change ──► codec.to_wire ──► clock.increment ──► Envelope ──► OutboundQueue
//!
//! inbound bytes ──► SyncMessage ──► HoldbackBuffer ──► drain_ready loop
//!                                                          │
//!                           clock.merge ◄──────────────────┤
//!                           codec.apply_remote (remote) ◄──┘
//! ```
//!
//! All engine state lives in one [`SyncOrchestrator`] and is only touched
//! from one task: [`SyncOrchestrator::run`] multiplexes the change feed, the
//! inbound feed and both timers with `tokio::select!`.
//!
//! Session states: `Disconnected → Connecting → Synchronizing → Live`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use logos_core::{ChangeEvent, DocumentStore, Model, ModelRegistry, Origin, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::clock::LogicalClock;
use crate::codec::{Applied, CodecError, CodecSet};
use crate::holdback::HoldbackBuffer;
use crate::protocol::{
    Batch, Command, Envelope, MessageType, OperationKind, ProtocolError, SyncMessage,
};
use crate::queue::{DeliveryHandler, OutboundQueue, QueueConfig, QueueStats};
use crate::transport::Transport;
use crate::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Connected, waiting for the relay's history reply
    Synchronizing,
    Live,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    /// Remote operations held while waiting for their dependencies
    pub holdback_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            holdback_capacity: 1024,
        }
    }
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SessionState),
    /// A remote operation reached the document
    RemoteApplied {
        op_id: Uuid,
        origin_id: ParticipantId,
        kind: OperationKind,
        applied: Applied,
    },
    /// A remote operation was concurrent with local state; it was applied
    /// anyway and its fields win
    ConcurrentEdit {
        op_id: Uuid,
        origin_id: ParticipantId,
        kind: OperationKind,
    },
    /// Ephemeral interaction command from a peer
    Command {
        sender_id: ParticipantId,
        command: Command,
    },
    /// Local operation too large to send
    Oversize { op: Envelope, size: usize },
    /// Batch abandoned after exhausting its retries
    DeadLetter(Batch),
    /// `dropped` remote operations will never be applied: the holdback
    /// overflowed (a history resync follows), or the relay's history no
    /// longer has them. The document may need [`SyncOrchestrator::apply_snapshot`].
    ResyncRequired { dropped: usize },
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Why [`SyncOrchestrator::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Shutdown signalled (or its sender dropped)
    Shutdown,
    /// The connection's inbound feed ended
    InboundClosed,
    /// The document store's change feed ended
    ChangeFeedClosed,
}

/// Forwards queue give-ups to the application.
struct EventHandler {
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl DeliveryHandler for EventHandler {
    fn on_oversize(&mut self, op: Envelope, size: usize) {
        let _ = self.events.send(SyncEvent::Oversize { op, size });
    }

    fn on_dead_letter(&mut self, batch: Batch) {
        let _ = self.events.send(SyncEvent::DeadLetter(batch));
    }
}

pub struct SyncOrchestrator {
    participant_id: ParticipantId,
    session_id: Uuid,
    state: SessionState,
    clock: LogicalClock,
    holdback: HoldbackBuffer,
    queue: OutboundQueue,
    codecs: CodecSet,
    store: Arc<dyn DocumentStore>,
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncOrchestrator {
    pub fn new(
        participant_id: ParticipantId,
        session_id: Uuid,
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        registry: Arc<ModelRegistry>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let queue = OutboundQueue::new(
            participant_id,
            session_id,
            config.queue,
            transport.clone(),
            Box::new(EventHandler {
                events: events.clone(),
            }),
        );

        let orchestrator = Self {
            participant_id,
            session_id,
            state: SessionState::Disconnected,
            clock: LogicalClock::new(),
            holdback: HoldbackBuffer::new(config.holdback_capacity),
            queue,
            codecs: CodecSet::standard(),
            store,
            registry,
            transport,
            events,
        };
        (orchestrator, event_rx)
    }

    /// Replace the codec set (custom operation handling).
    pub fn with_codecs(mut self, codecs: CodecSet) -> Self {
        self.codecs = codecs;
        self
    }

    // ─── Session lifecycle ───────────────────────────────────────

    pub fn connect(&mut self) {
        self.set_state(SessionState::Connecting);
    }

    /// Ask the relay for the session history. The session goes live when
    /// the `sync` reply arrives.
    pub fn begin_sync(&mut self) -> Result<(), SyncError> {
        self.set_state(SessionState::Synchronizing);
        self.send_sync_request()
    }

    /// Enter the live state and flush anything queued while offline.
    pub fn go_live(&mut self, now: Instant) -> Result<(), SyncError> {
        self.set_state(SessionState::Live);
        self.queue.pump(now)?;
        Ok(())
    }

    pub fn mark_disconnected(&mut self) {
        if self.state != SessionState::Disconnected {
            self.set_state(SessionState::Disconnected);
            self.emit(SyncEvent::Disconnected);
        }
    }

    /// Tear the session down. In-flight state is discarded.
    pub fn dispose(&mut self) {
        self.queue.dispose();
        self.holdback.clear();
        self.mark_disconnected();
    }

    // ─── Local path ──────────────────────────────────────────────

    /// Turn a local change into a queued operation.
    ///
    /// Remote-origin events are ignored. Returns the new op id. On a codec
    /// failure the clock is left untouched and only this change is lost.
    pub fn on_local_change(
        &mut self,
        event: &ChangeEvent,
        now: Instant,
    ) -> Result<Option<Uuid>, SyncError> {
        if !event.is_local() {
            return Ok(None);
        }

        let kind = OperationKind::from(event.kind);
        let payload = self
            .codecs
            .require(kind)?
            .to_wire(event, &self.registry)?;

        let clock = self.clock.increment(self.participant_id);
        let envelope = Envelope::new(
            self.participant_id,
            self.session_id,
            clock.clone(),
            kind,
            payload,
        );
        let op_id = envelope.op_id();
        self.clock = clock;
        log::trace!(
            "Local {kind:?} on model {} as op {op_id} (seq {})",
            event.model_id,
            envelope.sequence()
        );

        self.queue.enqueue(envelope, now)?;
        Ok(Some(op_id))
    }

    /// Broadcast an ephemeral command. Best effort: never queued or retried.
    pub fn send_command(
        &self,
        command_type: impl Into<String>,
        params: Value,
    ) -> Result<bool, SyncError> {
        let bytes = SyncMessage::command(self.participant_id, command_type, params).encode()?;
        Ok(self.transport.send(bytes))
    }

    /// Replace the document with a snapshot obtained out of band.
    pub fn apply_snapshot(&mut self, models: Vec<Model>) -> Result<(), SyncError> {
        log::info!(
            "Applying snapshot of {} models to session {}",
            models.len(),
            self.session_id
        );
        self.store.replace_all(models, Origin::Remote)?;
        Ok(())
    }

    // ─── Remote path ─────────────────────────────────────────────

    /// Handle one inbound frame.
    pub fn handle_message(&mut self, bytes: &[u8], now: Instant) -> Result<(), SyncError> {
        let msg = SyncMessage::decode(bytes)?;
        if msg.sender_id == self.participant_id {
            log::trace!("Ignoring own {:?} echo", msg.msg_type);
            return Ok(());
        }

        match msg.msg_type {
            MessageType::Operation => {
                let batch = msg.batch()?;
                if !self.receive_batch(batch) {
                    self.request_resync(now);
                }
            }
            MessageType::Command => {
                let command = msg.command_data()?;
                self.emit(SyncEvent::Command {
                    sender_id: msg.sender_id,
                    command,
                });
            }
            MessageType::Ack => {
                let ack = msg.ack_data()?;
                self.queue.acknowledge(ack.batch_id, now)?;
            }
            MessageType::Sync => {
                let history = msg.history()?;
                log::debug!(
                    "History reply with {} batches for session {}",
                    history.batches.len(),
                    self.session_id
                );
                self.receive_history(history.batches);
                if self.state == SessionState::Synchronizing {
                    self.go_live(now)?;
                }
            }
            MessageType::Heartbeat => {}
            MessageType::SyncRequest => {
                log::debug!("Ignoring sync-request from {}", msg.sender_id);
            }
        }
        Ok(())
    }

    /// Admit every envelope of a batch, draining after each admission.
    /// Returns `false` if the holdback overflowed.
    fn receive_batch(&mut self, batch: Batch) -> bool {
        if batch.origin_id == self.participant_id {
            return true;
        }

        for op in batch.operations {
            if op.session_id() != self.session_id {
                log::warn!(
                    "Op {} belongs to session {}, not {}; ignored",
                    op.op_id(),
                    op.session_id(),
                    self.session_id
                );
                continue;
            }
            if LogicalClock::is_stale(op.clock(), &self.clock, &op.origin_id()) {
                log::trace!("Op {} already applied", op.op_id());
                continue;
            }
            if !self.holdback.admit(op) {
                return false;
            }
            self.deliver_ready();
        }
        true
    }

    /// Apply a relay history reply.
    ///
    /// The relay keeps a bounded history, so the oldest operations may be
    /// gone. The clock skips past such gaps so everything retained is still
    /// delivered. The reply is never re-requested: the relay would answer
    /// with the same history. Lost operations are reported once as
    /// [`SyncEvent::ResyncRequired`].
    fn receive_history(&mut self, batches: Vec<Batch>) {
        let floor = self.history_floor(&batches);
        let mut lost: u64 = floor
            .participants()
            .map(|p| floor.get(p).saturating_sub(self.clock.get(p)))
            .sum();
        if lost > 0 {
            log::warn!(
                "History for session {} lacks {lost} ops; skipping past the gap",
                self.session_id
            );
            self.clock = self.clock.merge(&floor);
            self.deliver_ready();
        }

        for batch in batches {
            if !self.receive_batch(batch) {
                lost += self.holdback.len() as u64 + 1;
                log::warn!(
                    "Holdback full while replaying history for session {}; {} ops dropped",
                    self.session_id,
                    self.holdback.len()
                );
                self.holdback.clear();
                break;
            }
        }

        if lost > 0 {
            self.emit(SyncEvent::ResyncRequired {
                dropped: usize::try_from(lost).unwrap_or(usize::MAX),
            });
        }
    }

    /// Lowest clock at which every operation in a history reply can be
    /// delivered. A participant's operations before its first retained one
    /// are gone, as is anything from a participant with nothing retained.
    fn history_floor(&self, batches: &[Batch]) -> LogicalClock {
        let mut first: HashMap<ParticipantId, u64> = HashMap::new();
        let mut depends_on = LogicalClock::new();
        let ops = batches
            .iter()
            .filter(|b| b.origin_id != self.participant_id)
            .flat_map(|b| b.operations.iter())
            .filter(|op| op.session_id() == self.session_id);
        for op in ops {
            first
                .entry(op.origin_id())
                .and_modify(|seq| *seq = (*seq).min(op.sequence()))
                .or_insert(op.sequence());
            depends_on = depends_on.merge(op.clock());
        }

        depends_on
            .participants()
            .filter(|p| **p != self.participant_id)
            .map(|p| {
                let floor = match first.get(p) {
                    Some(seq) => seq.saturating_sub(1),
                    None => depends_on.get(p),
                };
                (*p, floor)
            })
            .collect()
    }

    /// Drain the holdback to a fixed point.
    fn deliver_ready(&mut self) {
        loop {
            let ready = self.holdback.drain_ready(&self.clock);
            if ready.is_empty() {
                break;
            }
            for op in ready {
                self.deliver(op);
            }
        }
    }

    fn deliver(&mut self, op: Envelope) {
        let origin = op.origin_id();
        if LogicalClock::is_stale(op.clock(), &self.clock, &origin) {
            return;
        }

        if op.clock().is_concurrent(&self.clock) {
            log::debug!("Op {} from {origin} is concurrent with local state", op.op_id());
            self.emit(SyncEvent::ConcurrentEdit {
                op_id: op.op_id(),
                origin_id: origin,
                kind: op.kind(),
            });
        }

        // Consumed even if application fails, so later ops are not blocked
        self.clock = self.clock.merge(op.clock());

        let result = self.codecs.require(op.kind()).and_then(|codec| {
            codec.apply_remote(op.payload(), self.store.as_ref(), &self.registry)
        });
        match result {
            Ok(applied) => self.emit(SyncEvent::RemoteApplied {
                op_id: op.op_id(),
                origin_id: origin,
                kind: op.kind(),
                applied,
            }),
            Err(e) => log::warn!("Failed to apply op {} from {origin}: {e}", op.op_id()),
        }
    }

    fn request_resync(&mut self, now: Instant) {
        let dropped = self.holdback.len();
        log::warn!(
            "Holdback full ({} ops) in session {}; requesting resync",
            dropped,
            self.session_id
        );
        self.holdback.clear();
        self.emit(SyncEvent::ResyncRequired { dropped });
        self.set_state(SessionState::Synchronizing);
        if let Err(e) = self.send_sync_request() {
            log::error!("Failed to request resync: {e}");
        }
        // Keep local delivery moving while we wait
        if let Err(e) = self.queue.poll_flush(now) {
            log::error!("Flush during resync failed: {e}");
        }
    }

    fn send_sync_request(&self) -> Result<(), SyncError> {
        let bytes = SyncMessage::sync_request(self.participant_id, self.session_id).encode()?;
        if !self.transport.send(bytes) {
            log::warn!("Sync request for session {} not sent", self.session_id);
        }
        Ok(())
    }

    // ─── Timers ──────────────────────────────────────────────────

    /// Run the flush debounce and the retry sweep.
    pub fn tick(&mut self, now: Instant) -> Result<(), SyncError> {
        self.queue.poll_flush(now)?;
        self.queue.retry_due(now)?;
        Ok(())
    }

    /// Drive the session until shutdown or until one of the feeds closes.
    ///
    /// Local changes are consumed only while live; until then they stay
    /// buffered in `changes`. Inbound frames are always processed so the
    /// history reply can complete the handshake.
    pub async fn run(
        &mut self,
        changes: &mut mpsc::UnboundedReceiver<ChangeEvent>,
        inbound: &mut mpsc::Receiver<Vec<u8>>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> RunExit {
        let mut retry = tokio::time::interval(self.queue.config().retry_sweep_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let live = self.state == SessionState::Live;
            let deadline = self.queue.flush_deadline();
            let flush_at = tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                _ = &mut *shutdown => {
                    log::debug!("Session {} shutting down", self.session_id);
                    return RunExit::Shutdown;
                }

                frame = inbound.recv() => match frame {
                    Some(bytes) => {
                        if let Err(e) = self.handle_message(&bytes, Instant::now()) {
                            log::warn!("Dropped inbound frame ({} bytes): {e}", bytes.len());
                        }
                    }
                    None => {
                        log::info!("Connection for session {} closed", self.session_id);
                        self.mark_disconnected();
                        return RunExit::InboundClosed;
                    }
                },

                change = changes.recv(), if live => match change {
                    Some(event) => {
                        if let Err(e) = self.on_local_change(&event, Instant::now()) {
                            log::warn!("Local change to model {} not synced: {e}", event.model_id);
                        }
                    }
                    None => {
                        log::info!("Change feed for session {} closed", self.session_id);
                        return RunExit::ChangeFeedClosed;
                    }
                },

                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    if let Err(e) = self.queue.poll_flush(Instant::now()) {
                        log::error!("Flush failed: {e}");
                    }
                }

                _ = retry.tick() => {
                    if let Err(e) = self.queue.retry_due(Instant::now()) {
                        log::error!("Retry sweep failed: {e}");
                    }
                }
            }
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn holdback_len(&self) -> usize {
        self.holdback.len()
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            log::info!(
                "Session {} ({}): {:?} -> {:?}",
                self.session_id,
                self.participant_id,
                self.state,
                next
            );
            self.state = next;
            self.emit(SyncEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: SyncEvent) {
        // The application may have dropped its receiver; the engine keeps going
        let _ = self.events.send(event);
    }
}
