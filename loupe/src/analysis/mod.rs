//! Analysis logic for capture data
//!
//! This module contains pure business logic for summarizing a capture,
//! separated from the protocol and the CLI presentation layer.

pub mod function_stats;

pub use function_stats::{FunctionHotspot, FunctionStats, FunctionTiming};
