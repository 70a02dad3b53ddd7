//! Append-only chain of event blocks
//!
//! Blocks live in an arena (`Vec<EventBlock>`) and link to each other by index, so
//! traversal never follows a dangling pointer. Only the `current` block accepts
//! appends; every other block is sealed.
//!
//! ```text
//!  root                                current
//!  ┌────────┐ next ┌────────┐ next ┌────────┐
//!  │ 1024   │─────▶│ 1024   │─────▶│  37    │◀── append
//!  │ sealed │◀─────│ sealed │◀─────│        │
//!  └────────┘ prev └────────┘ prev └────────┘
//! ```

use super::block::{BlockId, EventBlock};
use crate::domain::{StoreError, TimedEvent, TimestampNs};

/// Handle to one event stored in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventRef {
    pub block: BlockId,
    pub index: usize,
}

/// Direction for [`EventChain::find_neighbor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

/// Owns a sequence of [`EventBlock`]s in creation order.
#[derive(Debug)]
pub struct EventChain {
    blocks: Vec<EventBlock>,
    current: BlockId,
    num_events: u64,
}

impl EventChain {
    /// Create a chain holding one empty root block.
    ///
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if the root block cannot be allocated
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self { blocks: vec![EventBlock::allocate(None)?], current: BlockId(0), num_events: 0 })
    }

    /// Append an event to the current block, sealing it and opening a new one when
    /// it is full.
    ///
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if a new block cannot be allocated. The
    /// capture cannot continue after that.
    pub fn append(&mut self, event: TimedEvent) -> Result<EventRef, StoreError> {
        if self.current_block().at_capacity() {
            self.allocate_new_block()?;
        }
        let block = self.current;
        let index = self.blocks[block.0].push(event);
        self.num_events += 1;
        Ok(EventRef { block, index })
    }

    fn allocate_new_block(&mut self) -> Result<(), StoreError> {
        debug_assert!(self.current_block().next.is_none());
        self.blocks.try_reserve(1).map_err(|_| StoreError::OutOfMemory(super::BLOCK_CAPACITY))?;
        let new_id = BlockId(self.blocks.len());
        self.blocks.push(EventBlock::allocate(Some(self.current))?);
        self.blocks[self.current.0].next = Some(new_id);
        self.current = new_id;
        Ok(())
    }

    fn current_block(&self) -> &EventBlock {
        &self.blocks[self.current.0]
    }

    /// The root block's id; the root never has a previous block
    #[must_use]
    pub fn root(&self) -> BlockId {
        BlockId(0)
    }

    /// The only block that still accepts appends
    #[must_use]
    pub fn current(&self) -> BlockId {
        self.current
    }

    #[must_use]
    pub fn is_sealed(&self, block: BlockId) -> bool {
        block != self.current
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&EventBlock> {
        self.blocks.get(id.0)
    }

    #[must_use]
    pub fn get(&self, event: EventRef) -> Option<&TimedEvent> {
        self.block(event.block)?.get(event.index)
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.num_events
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_events == 0
    }

    /// Iterate over blocks (not events) from the root following `next` links.
    ///
    /// Every call starts over at the root.
    #[must_use]
    pub fn blocks(&self) -> BlockIter<'_> {
        BlockIter { chain: self, next: Some(self.root()) }
    }

    /// Events overlapping `[t_min, t_max]`, skipping blocks that cannot contain any.
    pub fn events_in_range(
        &self,
        t_min: TimestampNs,
        t_max: TimestampNs,
    ) -> impl Iterator<Item = &TimedEvent> + '_ {
        self.blocks()
            .filter(move |(_, block)| block.intersects(t_min, t_max))
            .flat_map(|(_, block)| block.events().iter())
            .filter(move |event| event.overlaps(t_min, t_max))
    }

    /// All events in append order
    pub fn iter(&self) -> impl Iterator<Item = &TimedEvent> + '_ {
        self.blocks().flat_map(|(_, block)| block.events().iter())
    }

    /// The event stored right before or after `event`, stepping into the
    /// neighboring block when `event` sits at a block boundary.
    #[must_use]
    pub fn find_neighbor(&self, event: EventRef, direction: Direction) -> Option<EventRef> {
        let block = self.block(event.block)?;
        if event.index >= block.len() {
            return None;
        }
        match direction {
            Direction::Next => {
                if event.index + 1 < block.len() {
                    return Some(EventRef { block: event.block, index: event.index + 1 });
                }
                let next = block.next?;
                let next_block = self.block(next)?;
                (!next_block.is_empty()).then_some(EventRef { block: next, index: 0 })
            }
            Direction::Previous => {
                if event.index > 0 {
                    return Some(EventRef { block: event.block, index: event.index - 1 });
                }
                let prev = block.prev?;
                let prev_block = self.block(prev)?;
                prev_block.len().checked_sub(1).map(|index| EventRef { block: prev, index })
            }
        }
    }

    /// Move every event of `other` to the end of this chain, preserving order.
    ///
    /// Blocks stay in append order, so after absorbing an older chain the block
    /// sequence is no longer sorted by `min_timestamp`. [`Self::events_in_range`]
    /// tests every block's bounds and does not rely on that order.
    ///
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if a new block cannot be allocated
    pub fn absorb(&mut self, other: EventChain) -> Result<(), StoreError> {
        for block in other.blocks {
            for event in block.into_events() {
                self.append(event)?;
            }
        }
        Ok(())
    }
}

/// Lazy, finite iterator over the blocks of a chain in creation order
pub struct BlockIter<'a> {
    chain: &'a EventChain,
    next: Option<BlockId>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = (BlockId, &'a EventBlock);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let block = self.chain.block(id)?;
        self.next = block.next;
        Some((id, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tid;
    use crate::store::BLOCK_CAPACITY;
    use proptest::prelude::*;

    fn timer(start: u64, end: u64) -> TimedEvent {
        TimedEvent {
            start,
            end,
            tid: Tid(1),
            function_id: start,
            callstack: None,
            depth: 0,
            user_data_key: None,
        }
    }

    fn chain_with(count: usize) -> EventChain {
        let mut chain = EventChain::new().unwrap();
        for i in 0..count as u64 {
            chain.append(timer(i * 10, i * 10 + 5)).unwrap();
        }
        chain
    }

    #[test]
    fn test_new_chain_is_empty() {
        let chain = EventChain::new().unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.num_blocks(), 1);
        assert_eq!(chain.root(), chain.current());
        assert!(chain.block(chain.root()).unwrap().prev().is_none());
    }

    #[test]
    fn test_multiple_of_capacity_produces_full_blocks() {
        let chain = chain_with(3 * BLOCK_CAPACITY);
        assert_eq!(chain.num_blocks(), 3);
        assert_eq!(chain.len(), 3 * BLOCK_CAPACITY as u64);
        for (_, block) in chain.blocks() {
            assert!(block.at_capacity());
        }
        let unsealed = chain.blocks().filter(|(id, _)| !chain.is_sealed(*id)).count();
        assert_eq!(unsealed, 1);
    }

    #[test]
    fn test_append_past_capacity_opens_new_block() {
        let chain = chain_with(BLOCK_CAPACITY + 1);
        assert_eq!(chain.num_blocks(), 2);
        let (last_id, last) = chain.blocks().last().unwrap();
        assert_eq!(last_id, chain.current());
        assert_eq!(last.len(), 1);
        assert_eq!(last.prev(), Some(chain.root()));
    }

    #[test]
    fn test_block_iteration_is_restartable_and_ordered() {
        let chain = chain_with(2 * BLOCK_CAPACITY + 10);
        let first: Vec<BlockId> = chain.blocks().map(|(id, _)| id).collect();
        let second: Vec<BlockId> = chain.blocks().map(|(id, _)| id).collect();
        assert_eq!(first, second);

        let mins: Vec<u64> = chain.blocks().map(|(_, b)| b.min_timestamp()).collect();
        assert!(mins.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_find_neighbor_crosses_block_boundaries() {
        let chain = chain_with(BLOCK_CAPACITY + 2);
        let last_of_root = EventRef { block: chain.root(), index: BLOCK_CAPACITY - 1 };

        let next = chain.find_neighbor(last_of_root, Direction::Next).unwrap();
        assert_eq!(next.block, chain.current());
        assert_eq!(next.index, 0);
        assert_eq!(chain.get(next).unwrap().start, BLOCK_CAPACITY as u64 * 10);

        let back = chain.find_neighbor(next, Direction::Previous).unwrap();
        assert_eq!(back, last_of_root);
    }

    #[test]
    fn test_find_neighbor_at_chain_ends() {
        let chain = chain_with(3);
        let first = EventRef { block: chain.root(), index: 0 };
        let last = EventRef { block: chain.root(), index: 2 };
        assert!(chain.find_neighbor(first, Direction::Previous).is_none());
        assert!(chain.find_neighbor(last, Direction::Next).is_none());
        assert!(chain.find_neighbor(EventRef { block: chain.root(), index: 9 }, Direction::Next)
            .is_none());
    }

    #[test]
    fn test_events_in_range_filters_blocks_and_events() {
        let chain = chain_with(3 * BLOCK_CAPACITY);
        let hits: Vec<u64> = chain.events_in_range(10_000, 10_025).map(|e| e.start).collect();
        assert_eq!(hits, vec![10_000, 10_010, 10_020]);
    }

    #[test]
    fn test_absorb_preserves_order() {
        let mut a = chain_with(5);
        let mut b = EventChain::new().unwrap();
        b.append(timer(1000, 1001)).unwrap();
        b.append(timer(1010, 1011)).unwrap();
        a.absorb(b).unwrap();
        let starts: Vec<u64> = a.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![0, 10, 20, 30, 40, 1000, 1010]);
        assert_eq!(a.len(), 7);
        let root = a.block(a.root()).unwrap();
        assert_eq!(root.min_timestamp(), 0);
        assert_eq!(root.max_timestamp(), 1011);
    }

    #[test]
    fn test_absorb_across_blocks_keeps_bounds() {
        let mut a = chain_with(BLOCK_CAPACITY - 1);
        let mut b = EventChain::new().unwrap();
        for i in 0..3u64 {
            b.append(timer(50_000 + i * 10, 50_000 + i * 10 + 5)).unwrap();
        }
        a.absorb(b).unwrap();

        assert_eq!(a.num_blocks(), 2);
        let (_, last) = a.blocks().last().unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last.min_timestamp(), 50_010);
        assert_eq!(last.max_timestamp(), 50_025);
        let after: Vec<u64> = a.iter().skip(BLOCK_CAPACITY - 1).map(|e| e.start).collect();
        assert_eq!(after, vec![50_000, 50_010, 50_020]);
    }

    #[test]
    fn test_range_query_after_absorbing_older_events() {
        let mut a = EventChain::new().unwrap();
        for i in 0..(BLOCK_CAPACITY as u64) {
            a.append(timer(1_000_000 + i * 10, 1_000_000 + i * 10 + 5)).unwrap();
        }
        let older = chain_with(20);
        a.absorb(older).unwrap();

        let mins: Vec<u64> = a.blocks().map(|(_, b)| b.min_timestamp()).collect();
        assert!(mins[0] > mins[1]);
        let hits: Vec<u64> = a.events_in_range(100, 125).map(|e| e.start).collect();
        assert_eq!(hits, vec![100, 110, 120]);
    }

    proptest! {
        #[test]
        fn prop_intersects_never_rejects_an_overlapping_block(
            spans in prop::collection::vec((0u64..100_000, 0u64..5_000), 1..3000),
            a in 0u64..110_000,
            len in 0u64..10_000,
        ) {
            let b = a + len;
            let mut chain = EventChain::new().unwrap();
            for (start, duration) in &spans {
                chain.append(timer(*start, start + duration)).unwrap();
            }
            for (_, block) in chain.blocks() {
                let any_overlap = block.events().iter().any(|e| e.overlaps(a, b));
                if !block.intersects(a, b) {
                    prop_assert!(!any_overlap);
                }
                if any_overlap {
                    prop_assert!(block.intersects(a, b));
                }
            }
        }

        #[test]
        fn prop_only_current_block_is_unsealed(count in 0usize..5000) {
            let chain = chain_with(count);
            let unsealed: Vec<BlockId> =
                chain.blocks().map(|(id, _)| id).filter(|id| !chain.is_sealed(*id)).collect();
            prop_assert_eq!(unsealed, vec![chain.current()]);
            prop_assert_eq!(chain.num_blocks(), count.div_ceil(BLOCK_CAPACITY).max(1));
        }
    }
}
