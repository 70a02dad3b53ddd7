//! # Event Block Store
//!
//! Append-only storage for recorded timers. Events are written into fixed-capacity
//! blocks chained together; each block tracks the time span of its contents so that
//! a scan for a time window can skip whole blocks.
//!
//! ## Concurrency
//!
//! A chain has a single writer. Producer threads each own a private chain
//! ([`ThreadTimers`]) and hand it to the session's [`TimerStore`] once they are
//! done, so the hot append path never takes a lock.
//!
//! ## Failure policy
//!
//! Block allocation failure is fatal to the capture (`StoreError::OutOfMemory`).
//! There is no eviction: the store only grows for the lifetime of a session.

pub mod block;
pub mod chain;
pub mod timers;

pub use block::{BlockId, EventBlock, BLOCK_CAPACITY};
pub use chain::{BlockIter, Direction, EventChain, EventRef};
pub use timers::{ThreadTimers, TimerStore};
