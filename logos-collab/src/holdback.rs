//! Holdback buffer for remote operations that are not yet causally ready.
//!
//! Remote envelopes are admitted here first and released by
//! [`HoldbackBuffer::drain_ready`] once the local clock satisfies their
//! dependencies. One drain pass can unlock entries for the next pass, so
//! callers drain until a pass comes back empty.

use std::collections::VecDeque;

use crate::clock::LogicalClock;
use crate::protocol::Envelope;

/// Bounded set of held remote operations, in arrival order.
#[derive(Debug, Clone)]
pub struct HoldbackBuffer {
    entries: VecDeque<Envelope>,
    capacity: usize,
}

impl HoldbackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Hold an operation. Returns `false` when the buffer is full: the
    /// replica has fallen too far behind and needs a resync.
    ///
    /// An operation already held (same op id) is accepted without storing a
    /// second copy.
    pub fn admit(&mut self, op: Envelope) -> bool {
        if self.entries.iter().any(|held| held.op_id() == op.op_id()) {
            log::trace!("Op {} already held", op.op_id());
            return true;
        }
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(op);
        true
    }

    /// One pass over the buffer: returns every causally ready entry in
    /// buffer order and keeps the rest. Stale entries (already applied
    /// locally) are dropped.
    pub fn drain_ready(&mut self, local: &LogicalClock) -> Vec<Envelope> {
        let mut ready = Vec::new();
        let mut pending = VecDeque::with_capacity(self.entries.len());

        for op in self.entries.drain(..) {
            let sender = op.origin_id();
            if LogicalClock::is_causally_ready(op.clock(), local, &sender) {
                ready.push(op);
            } else if LogicalClock::is_stale(op.clock(), local, &sender) {
                log::debug!(
                    "Dropping redelivered op {} (seq {} from {sender})",
                    op.op_id(),
                    op.sequence()
                );
            } else {
                pending.push_back(op);
            }
        }

        self.entries = pending;
        ready
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
