use std::collections::{BTreeSet, HashSet};

use crate::models::event::{EventKey, EventRecord};

/// `(transactionHash, logIndex)` pairs already delivered.
///
/// With a capacity, the lowest block heights are forgotten first. A
/// forgotten event arriving again would be delivered a second time.
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: HashSet<EventKey>,
    by_block: BTreeSet<(u64, EventKey)>,
    capacity: Option<usize>,
}

impl SeenSet {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            keys: HashSet::new(),
            by_block: BTreeSet::new(),
            capacity: capacity.map(|c| c.max(1)),
        }
    }

    /// Record `record` as seen. False when it was seen before.
    pub fn insert(&mut self, record: &EventRecord) -> bool {
        let key = record.key();
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.by_block.insert((record.block_number, key));

        if let Some(capacity) = self.capacity {
            while self.keys.len() > capacity {
                match self.by_block.pop_first() {
                    Some((_, evicted)) => {
                        self.keys.remove(&evicted);
                    }
                    None => break,
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}
