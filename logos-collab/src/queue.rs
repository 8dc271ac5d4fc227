//! Outbound operation queue: batching, backpressure, retry, dead-letter.
//!
//! ```text
//! enqueue ──► pending ──flush──► [batch] ──send──► in-flight ──ack──► done
//!    │           ▲                  │                  │
//!    │           └── send failed ───┘                  ├─ retry (backoff)
//!    └─ oversize ──► DeliveryHandler ◄── dead-letter ──┘
//! ```
//!
//! The queue owns no timers. Every time-dependent call takes `now`; the
//! session driver decides when to call [`OutboundQueue::poll_flush`] (see
//! [`OutboundQueue::flush_deadline`]) and [`OutboundQueue::retry_due`].
//!
//! Reference: Kleppmann, Chapter 8, "The Trouble with Distributed Systems"

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Batch, Envelope, ProtocolError, SyncMessage};
use crate::transport::Transport;
use crate::ParticipantId;

/// Queue limits. All sizes are JSON-encoded bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum operations per batch
    pub max_batch_ops: usize,
    /// Debounce between the first pending op and the flush
    pub flush_interval: Duration,
    /// Maximum encoded size of one operation frame
    pub max_batch_bytes: usize,
    /// Maximum encoded size of a single operation
    pub max_op_bytes: usize,
    /// Batches sent but not yet acknowledged
    pub max_inflight_batches: usize,
    /// First retry delay; doubles per attempt
    pub retry_base: Duration,
    /// Upper bound on the backoff delay
    pub max_retry_delay: Duration,
    /// Resends before a batch is dead-lettered
    pub max_retries: u32,
    /// How often the driver sweeps in-flight batches
    pub retry_sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_ops: 50,
            flush_interval: Duration::from_millis(50),
            max_batch_bytes: 256 * 1024,
            max_op_bytes: 64 * 1024,
            max_inflight_batches: 4,
            retry_base: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            max_retries: 5,
            retry_sweep_interval: Duration::from_millis(250),
        }
    }
}

impl QueueConfig {
    /// Delay before the next resend once `retry_count` resends happened.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.retry_base
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

/// Receives what the queue gives up on.
pub trait DeliveryHandler: Send {
    /// An operation too large to ever be sent; it has left the queue.
    fn on_oversize(&mut self, op: Envelope, size: usize);

    /// A batch that exhausted its retry budget; it has left the queue.
    fn on_dead_letter(&mut self, batch: Batch);
}

/// Counters for monitoring queue health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub batches_sent: u64,
    pub batches_acked: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub oversize: u64,
    pub send_failures: u64,
}

/// Result of one [`OutboundQueue::flush`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to send
    Idle,
    /// In-flight limit reached; pending ops wait for acks
    Backpressured,
    /// Transport refused the batch; ops are back at the front of pending
    SendFailed,
    Sent { batch_id: Uuid, operations: usize },
}

/// A sent batch awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct InflightRecord {
    pub batch: Batch,
    pub retry_count: u32,
    pub next_retry_at: Instant,
    /// Frame as first sent; resends reuse it
    encoded: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PendingOp {
    envelope: Envelope,
    size: usize,
}

pub struct OutboundQueue {
    origin_id: ParticipantId,
    session_id: Uuid,
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    handler: Box<dyn DeliveryHandler>,
    pending: VecDeque<PendingOp>,
    inflight: Vec<InflightRecord>,
    flush_deadline: Option<Instant>,
    stats: QueueStats,
    disposed: bool,
}

impl OutboundQueue {
    pub fn new(
        origin_id: ParticipantId,
        session_id: Uuid,
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        handler: Box<dyn DeliveryHandler>,
    ) -> Self {
        Self {
            origin_id,
            session_id,
            config,
            transport,
            handler,
            pending: VecDeque::new(),
            inflight: Vec::new(),
            flush_deadline: None,
            stats: QueueStats::default(),
            disposed: false,
        }
    }

    /// Queue a local operation and schedule a debounced flush.
    ///
    /// Operations larger than `max_op_bytes` go straight to the oversize
    /// handler and never enter the queue.
    pub fn enqueue(&mut self, op: Envelope, now: Instant) -> Result<(), ProtocolError> {
        if self.disposed {
            log::warn!("Enqueue after dispose, op {} dropped", op.op_id());
            return Ok(());
        }

        let size = op.encoded_len()?;
        if size > self.config.max_op_bytes {
            self.reject_oversize(op, size);
            return Ok(());
        }

        self.pending.push_back(PendingOp { envelope: op, size });
        self.flush_deadline = if self.pending.len() >= self.config.max_batch_ops {
            Some(now)
        } else {
            Some(
                self.flush_deadline
                    .unwrap_or(now + self.config.flush_interval),
            )
        };
        Ok(())
    }

    /// Pack pending operations into one batch and send it.
    pub fn flush(&mut self, now: Instant) -> Result<FlushOutcome, ProtocolError> {
        if self.pending.is_empty() {
            return Ok(FlushOutcome::Idle);
        }
        if self.inflight.len() >= self.config.max_inflight_batches {
            log::debug!(
                "Backpressure: {} batches in flight, {} ops pending",
                self.inflight.len(),
                self.pending.len()
            );
            return Ok(FlushOutcome::Backpressured);
        }

        let mut batch = Batch::new(self.origin_id, self.session_id, Vec::new());
        // Frame size with an empty operations array; each op adds its own
        // encoded length plus one separator byte after the first.
        let mut frame_bytes = SyncMessage::operation(self.origin_id, &batch)?.encode()?.len();
        let mut sizes = Vec::new();

        while let Some(next) = self.pending.front() {
            if batch.operations.len() >= self.config.max_batch_ops {
                break;
            }
            let added = next.size + usize::from(!batch.operations.is_empty());
            if frame_bytes + added > self.config.max_batch_bytes {
                if batch.operations.is_empty() {
                    if let Some(op) = self.pending.pop_front() {
                        self.reject_oversize(op.envelope, op.size);
                    }
                    continue;
                }
                break;
            }
            if let Some(op) = self.pending.pop_front() {
                frame_bytes += added;
                sizes.push(op.size);
                batch.operations.push(op.envelope);
            }
        }

        if batch.operations.is_empty() {
            return Ok(FlushOutcome::Idle);
        }

        let encoded = SyncMessage::operation(self.origin_id, &batch)?.encode()?;
        if !self.transport.send(encoded.clone()) {
            self.stats.send_failures += 1;
            log::debug!(
                "Send failed, requeueing {} ops of batch {}",
                batch.operations.len(),
                batch.batch_id
            );
            for (envelope, size) in batch.operations.into_iter().zip(sizes).rev() {
                self.pending.push_front(PendingOp { envelope, size });
            }
            return Ok(FlushOutcome::SendFailed);
        }

        let outcome = FlushOutcome::Sent {
            batch_id: batch.batch_id,
            operations: batch.operations.len(),
        };
        log::debug!(
            "Sent batch {} ({} ops, {} bytes)",
            batch.batch_id,
            batch.operations.len(),
            encoded.len()
        );
        self.stats.batches_sent += 1;
        self.inflight.push(InflightRecord {
            batch,
            retry_count: 0,
            next_retry_at: now + self.config.retry_base,
            encoded,
        });
        Ok(outcome)
    }

    /// Flush repeatedly while batches keep going out.
    ///
    /// A failed send reschedules the flush one `retry_base` later.
    pub fn pump(&mut self, now: Instant) -> Result<FlushOutcome, ProtocolError> {
        loop {
            match self.flush(now)? {
                FlushOutcome::Sent { .. } => continue,
                FlushOutcome::SendFailed => {
                    self.flush_deadline = Some(now + self.config.retry_base);
                    return Ok(FlushOutcome::SendFailed);
                }
                other => return Ok(other),
            }
        }
    }

    /// Run the debounced flush if its deadline has passed.
    pub fn poll_flush(&mut self, now: Instant) -> Result<(), ProtocolError> {
        match self.flush_deadline {
            Some(deadline) if deadline <= now => {
                self.flush_deadline = None;
                self.pump(now)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Drop the in-flight record for an acknowledged batch, then flush
    /// anything that was held back by the in-flight limit.
    pub fn acknowledge(&mut self, batch_id: Uuid, now: Instant) -> Result<bool, ProtocolError> {
        let Some(index) = self.inflight.iter().position(|r| r.batch.batch_id == batch_id) else {
            log::debug!("Ack for unknown batch {batch_id}");
            return Ok(false);
        };
        self.inflight.remove(index);
        self.stats.batches_acked += 1;
        self.pump(now)?;
        Ok(true)
    }

    /// Resend or dead-letter every in-flight batch whose retry time passed.
    pub fn retry_due(&mut self, now: Instant) -> Result<(), ProtocolError> {
        let mut freed = false;
        let mut index = 0;
        while index < self.inflight.len() {
            if self.inflight[index].next_retry_at > now {
                index += 1;
                continue;
            }

            if self.inflight[index].retry_count >= self.config.max_retries {
                let record = self.inflight.remove(index);
                self.stats.dead_lettered += 1;
                log::warn!(
                    "Batch {} dead-lettered after {} retries ({} ops)",
                    record.batch.batch_id,
                    record.retry_count,
                    record.batch.operations.len()
                );
                self.handler.on_dead_letter(record.batch);
                freed = true;
                continue;
            }

            let record = &mut self.inflight[index];
            if !self.transport.send(record.encoded.clone()) {
                self.stats.send_failures += 1;
            }
            record.retry_count += 1;
            record.next_retry_at = now + self.config.backoff(record.retry_count);
            self.stats.retries += 1;
            log::debug!(
                "Retried batch {} (attempt {})",
                record.batch.batch_id,
                record.retry_count
            );
            index += 1;
        }

        if freed {
            self.pump(now)?;
        }
        Ok(())
    }

    /// Stop and discard everything; in-flight batches are lost.
    pub fn dispose(&mut self) {
        if !self.disposed {
            log::info!(
                "Outbound queue disposed ({} pending ops, {} in-flight batches discarded)",
                self.pending.len(),
                self.inflight.len()
            );
        }
        self.pending.clear();
        self.inflight.clear();
        self.flush_deadline = None;
        self.disposed = true;
    }

    fn reject_oversize(&mut self, op: Envelope, size: usize) {
        self.stats.oversize += 1;
        log::warn!(
            "Op {} is {size} bytes, over the send limit; routed to oversize handler",
            op.op_id()
        );
        self.handler.on_oversize(op, size);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn inflight(&self) -> &[InflightRecord] {
        &self.inflight
    }

    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    /// Earliest retry time among in-flight batches.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.inflight.iter().map(|r| r.next_retry_at).min()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}
