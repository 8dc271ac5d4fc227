//! Bounded per-room operation history kept by the relay.
//!
//! Answers `sync-request` for late joiners and for clients that overflowed
//! their holdback. Oldest batches are evicted first; a batch id that is
//! still retained is recognised as a resend and not relayed twice. At least
//! one batch is always retained, so a resend of the newest batch is caught.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use crate::protocol::Batch;

#[derive(Debug, Clone)]
pub struct HistoryLog {
    batches: VecDeque<Batch>,
    retained: HashSet<Uuid>,
    capacity: usize,
    evicted: u64,
}

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            batches: VecDeque::with_capacity(capacity.min(1024)),
            retained: HashSet::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Append a batch. Returns `false` for a batch id already retained.
    pub fn record(&mut self, batch: Batch) -> bool {
        if self.retained.contains(&batch.batch_id) {
            return false;
        }
        while self.batches.len() >= self.capacity {
            if let Some(oldest) = self.batches.pop_front() {
                self.retained.remove(&oldest.batch_id);
                self.evicted += 1;
            }
        }
        self.retained.insert(batch.batch_id);
        self.batches.push_back(batch);
        true
    }

    /// Retained batches, oldest first.
    pub fn snapshot(&self) -> Vec<Batch> {
        self.batches.iter().cloned().collect()
    }

    pub fn contains(&self, batch_id: &Uuid) -> bool {
        self.retained.contains(batch_id)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        Batch::new(Uuid::from_u128(0xA), Uuid::nil(), Vec::new())
    }

    #[test]
    fn test_record_and_snapshot_order() {
        let mut log = HistoryLog::new(8);
        let (a, b) = (batch(), batch());
        assert!(log.record(a.clone()));
        assert!(log.record(b.clone()));
        assert_eq!(log.snapshot(), vec![a, b]);
    }

    #[test]
    fn test_duplicate_batch_rejected() {
        let mut log = HistoryLog::new(8);
        let a = batch();
        assert!(log.record(a.clone()));
        assert!(!log.record(a));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut log = HistoryLog::new(2);
        let (a, b, c) = (batch(), batch(), batch());
        log.record(a.clone());
        log.record(b.clone());
        log.record(c.clone());

        assert_eq!(log.snapshot(), vec![b, c]);
        assert_eq!(log.evicted(), 1);
        assert!(!log.contains(&a.batch_id));
    }

    #[test]
    fn test_zero_capacity_still_dedupes_latest() {
        let mut log = HistoryLog::new(0);
        assert_eq!(log.capacity(), 1);

        let (a, b) = (batch(), batch());
        assert!(log.record(a.clone()));
        assert!(!log.record(a.clone()));
        assert!(log.record(b.clone()));
        assert!(!log.record(b.clone()));
        assert_eq!(log.snapshot(), vec![b]);
    }
}
