use std::collections::BTreeMap;
use tracing::{error, warn};

use crate::models::event::{EventKey, EventRecord};

#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub record: EventRecord,
    /// Failed publish attempts so far.
    pub attempts: u32,
}

/// Events waiting to be republished, ordered by block.
///
/// Keyed by `(block, txHash, logIndex)`, so queueing the same event twice
/// keeps one entry. Anything dropped (over capacity or out of attempts)
/// pins `floor` at its block for the rest of the process, so the cursor
/// never skips it and a restart replays it.
#[derive(Debug)]
pub struct RetryQueue {
    pending: BTreeMap<(u64, EventKey), PendingEvent>,
    capacity: usize,
    max_attempts: u32,
    abandoned_floor: Option<u64>,
}

impl RetryQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
            max_attempts: max_attempts.max(1),
            abandoned_floor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, record: EventRecord, attempts: u32) {
        if attempts >= self.max_attempts {
            error!(
                "Giving up on {} at block {} after {} attempts",
                record.key(),
                record.block_number,
                attempts
            );
            self.abandon(record.block_number);
            return;
        }

        let key = (record.block_number, record.key());
        self.pending.insert(key, PendingEvent { record, attempts });

        if self.pending.len() > self.capacity {
            // The newest block is the cheapest to replay
            if let Some(((block, key), _)) = self.pending.pop_last() {
                warn!("Retry queue full, dropping {} at block {}", key, block);
                self.abandon(block);
            }
        }
    }

    /// Remove and return every pending event, lowest block first.
    pub fn take_all(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Lowest block that has not been fully published.
    pub fn floor(&self) -> Option<u64> {
        let pending = self.pending.keys().next().map(|(block, _)| *block);
        match (pending, self.abandoned_floor) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn abandon(&mut self, block: u64) {
        self.abandoned_floor = Some(self.abandoned_floor.map_or(block, |f| f.min(block)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::propagation::tests::sample_record;

    #[test]
    fn same_event_is_queued_once() {
        let mut queue = RetryQueue::new(10, 5);
        queue.push(sample_record(50, "0x50", 0), 1);
        queue.push(sample_record(50, "0x50", 0), 2);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_all()[0].attempts, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn floor_tracks_the_lowest_pending_block() {
        let mut queue = RetryQueue::new(10, 5);
        queue.push(sample_record(60, "0x60", 0), 1);
        queue.push(sample_record(50, "0x50", 0), 1);

        assert_eq!(queue.floor(), Some(50));
        let drained: Vec<u64> = queue.take_all().iter().map(|p| p.record.block_number).collect();
        assert_eq!(drained, vec![50, 60]);
        assert_eq!(queue.floor(), None);
    }

    #[test]
    fn overflow_drops_the_highest_block_and_pins_the_floor() {
        let mut queue = RetryQueue::new(2, 5);
        queue.push(sample_record(10, "0x10", 0), 1);
        queue.push(sample_record(20, "0x20", 0), 1);
        queue.push(sample_record(30, "0x30", 0), 1);

        assert_eq!(queue.len(), 2);
        queue.take_all();
        assert_eq!(queue.floor(), Some(30));
    }

    #[test]
    fn exhausted_events_are_abandoned() {
        let mut queue = RetryQueue::new(10, 3);
        queue.push(sample_record(40, "0x40", 0), 3);

        assert!(queue.is_empty());
        assert_eq!(queue.floor(), Some(40));
    }
}
