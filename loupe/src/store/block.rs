//! Fixed-capacity event blocks
//!
//! A block keeps the minimum start and maximum end timestamp of the events stored in
//! it, which allows rejecting a whole block against a time window without looking at
//! its events.

use crate::domain::{StoreError, TimedEvent, TimestampNs};

/// Number of events per block.
///
/// Large enough that nearly every append is a plain push; small enough that a
/// fresh block is a cheap allocation.
pub const BLOCK_CAPACITY: usize = 1024;

/// Index of a block inside its chain's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// An ordered run of at most [`BLOCK_CAPACITY`] events.
#[derive(Debug)]
pub struct EventBlock {
    events: Vec<TimedEvent>,
    min_timestamp: TimestampNs,
    max_timestamp: TimestampNs,
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
}

impl EventBlock {
    /// Allocate an empty block linked after `prev`.
    ///
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if the event storage cannot be reserved
    pub(crate) fn allocate(prev: Option<BlockId>) -> Result<Self, StoreError> {
        let mut events = Vec::new();
        events
            .try_reserve_exact(BLOCK_CAPACITY)
            .map_err(|_| StoreError::OutOfMemory(BLOCK_CAPACITY))?;
        Ok(Self {
            events,
            min_timestamp: TimestampNs::MAX,
            max_timestamp: TimestampNs::MIN,
            prev,
            next: None,
        })
    }

    pub(crate) fn push(&mut self, event: TimedEvent) -> usize {
        debug_assert!(!self.at_capacity());
        self.min_timestamp = self.min_timestamp.min(event.start);
        self.max_timestamp = self.max_timestamp.max(event.end);
        self.events.push(event);
        self.events.len() - 1
    }

    /// Tests if `[t_min, t_max]` intersects `[min_timestamp, max_timestamp]`.
    ///
    /// `false` guarantees that no event of this block overlaps the window. An empty
    /// block never intersects anything.
    #[must_use]
    pub fn intersects(&self, t_min: TimestampNs, t_max: TimestampNs) -> bool {
        !self.events.is_empty() && t_min <= self.max_timestamp && t_max >= self.min_timestamp
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.events.len() == BLOCK_CAPACITY
    }

    #[must_use]
    pub fn min_timestamp(&self) -> TimestampNs {
        self.min_timestamp
    }

    #[must_use]
    pub fn max_timestamp(&self) -> TimestampNs {
        self.max_timestamp
    }

    #[must_use]
    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    pub(crate) fn into_events(self) -> Vec<TimedEvent> {
        self.events
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TimedEvent> {
        self.events.get(index)
    }

    #[must_use]
    pub fn prev(&self) -> Option<BlockId> {
        self.prev
    }

    #[must_use]
    pub fn next(&self) -> Option<BlockId> {
        self.next
    }
}
