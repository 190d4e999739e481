//! Per-partition offset bookkeeping for manual commits and rewinds.
//!
//! Every message read from the broker is tracked until it is acknowledged.
//! Commits only ever advance to the lowest offset that is not yet complete, so
//! an acknowledged message never commits past an earlier one that is still in
//! flight or waiting to be redelivered.
//!
//! A nack rewinds the partition: every tracked offset at or after the nacked
//! one is forgotten and the partition's generation is bumped. Deliveries from
//! the old generation become stale: they are dropped before reaching the
//! caller, and their acknowledgements are ignored. Until the forwarding task
//! has performed the seek, newly read messages for that partition are dropped
//! as well, since the seek will fetch them again.

use std::collections::{BTreeMap, HashMap};

/// Where one delivered message sits in its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Position {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) generation: u64,
}

/// A seek the forwarding task has to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rewind {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) generation: u64,
}

#[derive(Debug, Default)]
struct PartitionState {
    generation: u64,
    /// Tracked offsets, mapped to the generation they were read in and
    /// whether they have been acknowledged.
    pending: BTreeMap<i64, (u64, bool)>,
    /// Next offset to commit.
    committed: Option<i64>,
    /// Generation of the rewind still waiting for its seek.
    rewinding: Option<u64>,
    /// Commits never pass this offset (set when a seek fails).
    ceiling: Option<i64>,
}

/// Offset state for every partition of one subscription.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionState>,
}

impl OffsetTracker {
    fn state(&mut self, topic: &str, partition: i32) -> &mut PartitionState {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
    }

    /// Start tracking a message that was just read.
    ///
    /// Returns `None` while the partition is waiting for a seek; the message
    /// will be fetched again afterwards.
    pub(crate) fn track(&mut self, topic: &str, partition: i32, offset: i64) -> Option<Position> {
        let state = self.state(topic, partition);
        if state.rewinding.is_some() {
            return None;
        }
        state.pending.insert(offset, (state.generation, false));
        Some(Position {
            topic: topic.to_string(),
            partition,
            offset,
            generation: state.generation,
        })
    }

    /// Whether the delivery at `position` is still owed to the caller.
    pub(crate) fn is_current(&self, position: &Position) -> bool {
        self.partitions
            .get(&(position.topic.clone(), position.partition))
            .and_then(|state| state.pending.get(&position.offset))
            .is_some_and(|&(generation, done)| generation == position.generation && !done)
    }

    /// Mark `position` as processed.
    ///
    /// Returns the offset to commit when the committable position advanced.
    pub(crate) fn complete(&mut self, position: &Position) -> Option<i64> {
        if !self.is_current(position) {
            return None;
        }
        let state = self.state(&position.topic, position.partition);
        state.pending.insert(position.offset, (position.generation, true));

        let mut next = None;
        while let Some(entry) = state.pending.first_entry() {
            if !entry.get().1 {
                break;
            }
            let offset = *entry.key();
            if state.ceiling.is_some_and(|ceiling| offset >= ceiling) {
                break;
            }
            entry.remove();
            next = Some(offset + 1);
        }

        let next = next?;
        if state.committed.is_some_and(|committed| committed >= next) {
            return None;
        }
        state.committed = Some(next);
        Some(next)
    }

    /// Rewind the partition to `position` so the message is read again.
    ///
    /// Returns the seek to perform, or `None` if the delivery is stale (an
    /// earlier rewind already covers it).
    pub(crate) fn rewind(&mut self, position: &Position) -> Option<Rewind> {
        if !self.is_current(position) {
            return None;
        }
        let state = self.state(&position.topic, position.partition);
        state.pending.retain(|&offset, _| offset < position.offset);
        state.generation += 1;
        state.rewinding = Some(state.generation);
        Some(Rewind {
            topic: position.topic.clone(),
            partition: position.partition,
            offset: position.offset,
            generation: state.generation,
        })
    }

    /// Record that the seek for `rewind` was performed.
    ///
    /// A failed seek caps commits below the rewound offset, so the message is
    /// redelivered after a restart instead of being skipped.
    pub(crate) fn rewound(&mut self, rewind: &Rewind, succeeded: bool) {
        let state = self.state(&rewind.topic, rewind.partition);
        if !succeeded {
            state.ceiling = Some(
                state
                    .ceiling
                    .map_or(rewind.offset, |ceiling| ceiling.min(rewind.offset)),
            );
        }
        if state.rewinding == Some(rewind.generation) {
            state.rewinding = None;
        }
    }
}
