//! Per-thread timer storage
//!
//! The session keeps one [`EventChain`] per thread. Live producers record into a
//! private [`ThreadTimers`] and the session absorbs it afterwards.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use super::chain::EventChain;
use crate::domain::{StoreError, Tid, TimedEvent, TimestampNs};

/// One chain per thread, iterated in thread id order
#[derive(Debug, Default)]
pub struct TimerStore {
    chains: BTreeMap<Tid, EventChain>,
    num_events: u64,
}

impl TimerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a timer to its thread's chain.
    ///
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if a block cannot be allocated
    pub fn append(&mut self, event: TimedEvent) -> Result<(), StoreError> {
        let chain = match self.chains.entry(event.tid) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(EventChain::new()?),
        };
        chain.append(event)?;
        self.num_events += 1;
        Ok(())
    }

    /// Take over the events of a finished producer.
    ///
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if a block cannot be allocated
    pub fn absorb(&mut self, timers: ThreadTimers) -> Result<(), StoreError> {
        let added = timers.chain.len();
        match self.chains.entry(timers.tid) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().absorb(timers.chain)?;
            }
            Entry::Vacant(entry) => {
                entry.insert(timers.chain);
            }
        }
        self.num_events += added;
        Ok(())
    }

    #[must_use]
    pub fn chain(&self, tid: Tid) -> Option<&EventChain> {
        self.chains.get(&tid)
    }

    pub fn chains(&self) -> impl Iterator<Item = (Tid, &EventChain)> + '_ {
        self.chains.iter().map(|(tid, chain)| (*tid, chain))
    }

    pub fn threads(&self) -> impl Iterator<Item = Tid> + '_ {
        self.chains.keys().copied()
    }

    /// Timers of all threads overlapping `[t_min, t_max]`
    pub fn events_in_range(
        &self,
        t_min: TimestampNs,
        t_max: TimestampNs,
    ) -> impl Iterator<Item = &TimedEvent> + '_ {
        self.chains.values().flat_map(move |chain| chain.events_in_range(t_min, t_max))
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.num_events
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_events == 0
    }
}

/// Private chain owned by a single producer thread.
#[derive(Debug)]
pub struct ThreadTimers {
    tid: Tid,
    chain: EventChain,
}

impl ThreadTimers {
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if the root block cannot be allocated
    pub fn new(tid: Tid) -> Result<Self, StoreError> {
        Ok(Self { tid, chain: EventChain::new()? })
    }

    /// Record one timer; timers of other threads are rejected by debug assertion.
    ///
    /// # Errors
    /// Returns [`StoreError::OutOfMemory`] if a block cannot be allocated
    pub fn record(&mut self, event: TimedEvent) -> Result<(), StoreError> {
        debug_assert_eq!(event.tid, self.tid);
        self.chain.append(event).map(|_| ())
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimedEvent> + '_ {
        self.chain.iter()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.chain.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(tid: u32, start: u64) -> TimedEvent {
        TimedEvent {
            start,
            end: start + 1,
            tid: Tid(tid),
            function_id: 0x1000,
            callstack: None,
            depth: 0,
            user_data_key: None,
        }
    }

    #[test]
    fn test_timers_are_split_by_thread() {
        let mut store = TimerStore::new();
        store.append(timer(2, 10)).unwrap();
        store.append(timer(1, 20)).unwrap();
        store.append(timer(2, 30)).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.threads().collect::<Vec<_>>(), vec![Tid(1), Tid(2)]);
        assert_eq!(store.chain(Tid(2)).unwrap().len(), 2);
    }

    #[test]
    fn test_producers_merge_into_store() {
        let handles: Vec<_> = (1..=4u32)
            .map(|tid| {
                std::thread::spawn(move || {
                    let mut timers = ThreadTimers::new(Tid(tid)).unwrap();
                    for i in 0..2000 {
                        timers.record(timer(tid, i)).unwrap();
                    }
                    timers
                })
            })
            .collect();

        let mut store = TimerStore::new();
        for handle in handles {
            store.absorb(handle.join().unwrap()).unwrap();
        }

        assert_eq!(store.len(), 8000);
        for (_, chain) in store.chains() {
            assert_eq!(chain.len(), 2000);
            let starts: Vec<u64> = chain.iter().map(|e| e.start).collect();
            assert!(starts.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_events_in_range_spans_threads() {
        let mut store = TimerStore::new();
        for tid in 1..=3 {
            for start in [0, 100, 200] {
                store.append(timer(tid, start)).unwrap();
            }
        }
        assert_eq!(store.events_in_range(90, 110).count(), 3);
    }
}
