use crate::events::EventIdentity;
use std::collections::{BTreeMap, HashSet};

/// Identities accepted within the last `window` blocks.
///
/// Catch-up and live delivery routinely overlap at the boundary block, so the
/// index must be consulted before every ledger mutation. Entries older than
/// the window are evicted as the checkpoint advances.
#[derive(Debug)]
pub struct DedupIndex {
    window: u64,
    by_block: BTreeMap<u64, HashSet<EventIdentity>>,
}

impl DedupIndex {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            by_block: BTreeMap::new(),
        }
    }

    /// Records `identity`; `false` means it was already seen.
    pub fn accept(&mut self, identity: EventIdentity) -> bool {
        self.by_block
            .entry(identity.block_number)
            .or_default()
            .insert(identity)
    }

    pub fn contains(&self, identity: &EventIdentity) -> bool {
        self.by_block
            .get(&identity.block_number)
            .is_some_and(|ids| ids.contains(identity))
    }

    /// Forgets one identity, e.g. a log the node reported as removed before it was committed.
    pub fn retract(&mut self, identity: &EventIdentity) -> bool {
        let Some(ids) = self.by_block.get_mut(&identity.block_number) else {
            return false;
        };
        let removed = ids.remove(identity);
        if ids.is_empty() {
            self.by_block.remove(&identity.block_number);
        }
        removed
    }

    /// Forgets every identity above `block`. Used when uncommitted work is discarded.
    pub fn discard_above(&mut self, block: u64) {
        self.by_block.split_off(&(block.saturating_add(1)));
    }

    /// Evicts blocks that fell out of the window behind `checkpoint`.
    pub fn advance(&mut self, checkpoint: u64) {
        let oldest_kept = checkpoint.saturating_sub(self.window - 1);
        self.by_block = self.by_block.split_off(&oldest_kept);
    }

    pub fn len(&self) -> usize {
        self.by_block.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_block.is_empty()
    }

    pub fn oldest_block(&self) -> Option<u64> {
        self.by_block.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tx_hash;

    fn id(block: u64, log_index: u64) -> EventIdentity {
        EventIdentity {
            block_number: block,
            log_index,
            transaction_hash: tx_hash(block, log_index),
        }
    }

    #[test]
    fn accepts_first_occurrence_only() {
        let mut index = DedupIndex::new(16);
        assert!(index.accept(id(10, 0)));
        assert!(!index.accept(id(10, 0)));
        assert!(index.accept(id(10, 1)));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn advance_evicts_blocks_outside_window() {
        let mut index = DedupIndex::new(3);
        for block in 1..=6 {
            index.accept(id(block, 0));
        }

        index.advance(6);
        assert_eq!(index.oldest_block(), Some(4));
        assert!(!index.contains(&id(3, 0)));
        assert!(index.contains(&id(4, 0)));
        assert!(index.contains(&id(6, 0)));
    }

    #[test]
    fn discard_above_forgets_uncommitted_blocks() {
        let mut index = DedupIndex::new(100);
        index.accept(id(200, 0));
        index.accept(id(201, 0));
        index.accept(id(203, 4));

        index.discard_above(200);
        assert!(index.contains(&id(200, 0)));
        assert!(index.accept(id(201, 0)));
        assert!(index.accept(id(203, 4)));
    }

    #[test]
    fn retract_allows_reacceptance() {
        let mut index = DedupIndex::new(8);
        index.accept(id(5, 2));
        assert!(index.retract(&id(5, 2)));
        assert!(!index.retract(&id(5, 2)));
        assert!(index.is_empty());
        assert!(index.accept(id(5, 2)));
    }
}
