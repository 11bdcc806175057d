// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Best-fit free list for returned sub-buffers.

Blocks are keyed by `(reserved size, free order)`, so the smallest adequate block is found
with a range scan instead of a walk over every freed block.  Among equally sized blocks the
one freed first wins.

No coalescing is performed.  Blocks are frame-scoped, and the owning arena is reset in bulk
at frame boundaries.
*/

use crate::bittricks::is_aligned;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    slot: u32,
    start: usize,
}

#[derive(Debug, Default)]
pub(crate) struct FreeList {
    blocks: BTreeMap<(usize, u64), FreeBlock>,
    next_seq: u64,
    free_bytes: usize,
}

impl FreeList {
    pub fn insert(&mut self, slot: u32, start: usize, reserved: usize) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.free_bytes += reserved;
        self.blocks.insert((reserved, seq), FreeBlock { slot, start });
    }

    fn find_best_fit(&self, required: usize, alignment: usize) -> Option<(usize, u64)> {
        self.blocks
            .range((required, 0)..)
            .find(|(_, block)| is_aligned(block.start, alignment))
            .map(|(key, _)| *key)
    }

    /// Whether a block of at least `required` bytes starting at an `alignment` boundary is free.
    pub fn has_fit(&self, required: usize, alignment: usize) -> bool {
        self.find_best_fit(required, alignment).is_some()
    }

    /// Removes and returns the slot of the smallest block that can hold `required` bytes
    /// at `alignment`.
    pub fn take_best_fit(&mut self, required: usize, alignment: usize) -> Option<u32> {
        let key = self.find_best_fit(required, alignment)?;
        let block = self.blocks.remove(&key)?;
        self.free_bytes -= key.0;
        Some(block.slot)
    }

    /// Empties the list, returning every slot it held.
    pub fn drain_slots(&mut self) -> Vec<u32> {
        self.free_bytes = 0;
        std::mem::take(&mut self.blocks)
            .into_values()
            .map(|block| block.slot)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::FreeList;

    #[test]
    fn picks_smallest_adequate_block() {
        let mut list = FreeList::default();
        list.insert(1, 0, 256);
        list.insert(2, 256, 64);
        list.insert(3, 320, 128);
        assert_eq!(list.take_best_fit(100, 16), Some(3));
        assert_eq!(list.take_best_fit(100, 16), Some(1));
        assert_eq!(list.take_best_fit(100, 16), None);
        assert_eq!(list.len(), 1);
        assert_eq!(list.free_bytes(), 64);
    }

    #[test]
    fn equal_sizes_come_back_in_free_order() {
        let mut list = FreeList::default();
        list.insert(7, 512, 32);
        list.insert(4, 0, 32);
        assert_eq!(list.take_best_fit(32, 1), Some(7));
        assert_eq!(list.take_best_fit(32, 1), Some(4));
    }

    #[test]
    fn skips_blocks_that_violate_alignment() {
        let mut list = FreeList::default();
        list.insert(1, 48, 64);
        list.insert(2, 256, 512);
        assert!(list.has_fit(64, 16));
        assert_eq!(list.take_best_fit(64, 256), Some(2));
        assert!(!list.has_fit(64, 256));
    }

    #[test]
    fn drain_returns_everything() {
        let mut list = FreeList::default();
        list.insert(1, 0, 8);
        list.insert(2, 8, 8);
        let mut slots = list.drain_slots();
        slots.sort();
        assert_eq!(slots, vec![1, 2]);
        assert_eq!(list.len(), 0);
        assert_eq!(list.free_bytes(), 0);
    }
}
