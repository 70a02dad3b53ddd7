//! Per-function timing statistics.
//!
//! Aggregates timers by function as they stream in, so the top functions of a
//! capture can be reported without rescanning the event store.
//!
//! # Performance
//!
//! - `record()`: O(1) amortized (HashMap insert/update)
//! - `hotspots()`: O(n log n) where n = unique functions (sorting)

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::domain::{FunctionInfo, Tid, TimedEvent};

/// Timing of all calls to one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionTiming {
    pub count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl FunctionTiming {
    fn new() -> Self {
        Self { count: 0, total_ns: 0, min_ns: u64::MAX, max_ns: 0 }
    }

    fn record(&mut self, duration: u64) {
        self.count += 1;
        self.total_ns = self.total_ns.saturating_add(duration);
        self.min_ns = self.min_ns.min(duration);
        self.max_ns = self.max_ns.max(duration);
    }

    #[must_use]
    pub fn average_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ns / self.count
        }
    }
}

/// A function ranked by total time, ready for display.
///
/// ```text
/// FUNCTION                    CALLS     TOTAL      AVG      MIN      MAX
/// app::render                  1200   812.4ms   0.68ms   0.41ms   3.20ms
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct FunctionHotspot {
    pub function_id: u64,
    pub name: String,
    pub count: u64,
    pub total_ns: u64,
    pub average_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    /// Share of the time of all recorded timers (0.0 - 100.0)
    pub percentage: f64,
    /// Calls per thread
    pub threads: BTreeMap<u32, u64>,
}

#[derive(Debug, Clone)]
struct Entry {
    timing: FunctionTiming,
    threads: BTreeMap<Tid, u64>,
}

/// Streaming aggregator keyed by function address
#[derive(Debug, Default, Clone)]
pub struct FunctionStats {
    functions: HashMap<u64, Entry>,
    total_ns: u64,
}

impl FunctionStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, timer: &TimedEvent) {
        let duration = timer.duration();
        self.total_ns = self.total_ns.saturating_add(duration);
        let entry = self
            .functions
            .entry(timer.function_id)
            .or_insert_with(|| Entry { timing: FunctionTiming::new(), threads: BTreeMap::new() });
        entry.timing.record(duration);
        *entry.threads.entry(timer.tid).or_insert(0) += 1;
    }

    #[must_use]
    pub fn get(&self, function_id: u64) -> Option<FunctionTiming> {
        self.functions.get(&function_id).map(|entry| entry.timing)
    }

    #[must_use]
    pub fn total_ns(&self) -> u64 {
        self.total_ns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// The `limit` functions with the highest total time, names taken from
    /// `functions` (keyed by absolute address).
    #[must_use]
    pub fn hotspots(
        &self,
        functions: &HashMap<u64, FunctionInfo>,
        limit: usize,
    ) -> Vec<FunctionHotspot> {
        let mut hotspots: Vec<FunctionHotspot> = self
            .functions
            .iter()
            .map(|(&function_id, entry)| {
                let percentage = if self.total_ns > 0 {
                    (entry.timing.total_ns as f64 / self.total_ns as f64) * 100.0
                } else {
                    0.0
                };
                let name = functions.get(&function_id).map_or_else(
                    || format!("0x{function_id:x}"),
                    |f| f.display_name().to_string(),
                );
                FunctionHotspot {
                    function_id,
                    name,
                    count: entry.timing.count,
                    total_ns: entry.timing.total_ns,
                    average_ns: entry.timing.average_ns(),
                    min_ns: entry.timing.min_ns,
                    max_ns: entry.timing.max_ns,
                    percentage,
                    threads: entry.threads.iter().map(|(tid, count)| (tid.0, *count)).collect(),
                }
            })
            .collect();

        // Ties broken by address so the report is stable
        hotspots.sort_unstable_by(|a, b| {
            b.total_ns.cmp(&a.total_ns).then(a.function_id.cmp(&b.function_id))
        });
        hotspots.truncate(limit);
        hotspots
    }
}
