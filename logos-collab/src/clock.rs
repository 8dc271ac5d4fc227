//! Vector clock for causal ordering of operations.
//!
//! Each participant owns one coordinate and bumps it by exactly one per
//! emitted operation. Clocks are values: `increment` and `merge` return new
//! clocks and never touch their inputs.
//!
//! Reference: Kleppmann, Chapter 5, "Detecting Concurrent Writes"

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ParticipantId;

/// Participant id → operation counter. Missing coordinates read as 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalClock {
    counters: BTreeMap<ParticipantId, u64>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a participant (0 if never seen).
    pub fn get(&self, participant: &ParticipantId) -> u64 {
        self.counters.get(participant).copied().unwrap_or(0)
    }

    /// Known participants, sorted.
    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.counters.keys()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Copy with `participant`'s counter advanced by one.
    pub fn increment(&self, participant: ParticipantId) -> Self {
        let mut next = self.clone();
        *next.counters.entry(participant).or_insert(0) += 1;
        next
    }

    /// Pointwise maximum over the union of both key sets.
    pub fn merge(&self, other: &LogicalClock) -> Self {
        let mut merged = self.clone();
        for (participant, &count) in &other.counters {
            let entry = merged.counters.entry(*participant).or_insert(0);
            *entry = (*entry).max(count);
        }
        merged
    }

    /// Every coordinate of `self` is `>=` the matching one in `other`.
    pub fn dominates(&self, other: &LogicalClock) -> bool {
        other
            .counters
            .iter()
            .all(|(participant, &count)| self.get(participant) >= count)
    }

    /// Neither clock dominates: some coordinate is ahead on each side.
    pub fn is_concurrent(&self, other: &LogicalClock) -> bool {
        let mut self_ahead = false;
        let mut other_ahead = false;
        for participant in self.counters.keys().chain(other.counters.keys()) {
            let (a, b) = (self.get(participant), other.get(participant));
            self_ahead |= a > b;
            other_ahead |= b > a;
            if self_ahead && other_ahead {
                return true;
            }
        }
        false
    }

    /// Whether an operation stamped `op_clock` by `sender` can be applied
    /// on a replica whose clock is `local`.
    ///
    /// The op must be the very next one from `sender` (per-sender FIFO) and
    /// must not depend on anything from a third participant that `local`
    /// has not yet seen.
    pub fn is_causally_ready(
        op_clock: &LogicalClock,
        local: &LogicalClock,
        sender: &ParticipantId,
    ) -> bool {
        if op_clock.get(sender) != local.get(sender) + 1 {
            return false;
        }
        op_clock
            .counters
            .iter()
            .filter(|(participant, _)| *participant != sender)
            .all(|(participant, &count)| count <= local.get(participant))
    }

    /// The op's sender coordinate has already been applied locally, so the
    /// op is a redelivery.
    pub fn is_stale(op_clock: &LogicalClock, local: &LogicalClock, sender: &ParticipantId) -> bool {
        op_clock.get(sender) <= local.get(sender)
    }
}

// Absent and zero coordinates are the same clock.
impl PartialEq for LogicalClock {
    fn eq(&self, other: &Self) -> bool {
        self.dominates(other) && other.dominates(self)
    }
}

impl Eq for LogicalClock {}

impl FromIterator<(ParticipantId, u64)> for LogicalClock {
    fn from_iter<I: IntoIterator<Item = (ParticipantId, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

impl<const N: usize> From<[(ParticipantId, u64); N]> for LogicalClock {
    fn from(entries: [(ParticipantId, u64); N]) -> Self {
        entries.into_iter().collect()
    }
}
