//! # loupe - Profiler Capture Engine
//!
//! loupe records function timers, call-stack samples, context switches and
//! tracepoints from an instrumented process, keeps them in memory for analysis,
//! and saves or replays them as capture files.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │   Live agent         │          │   Capture file       │
//! │ (AgentTransport)     │          │ (.loupe)             │
//! └──────────┬───────────┘          └──────────┬───────────┘
//!            │ AgentMessage                    │ framed messages
//!            ▼                                 ▼
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │  CaptureController   │          │  protocol::loader    │
//! │  (session ids, pump) │          │  (version, cancel)   │
//! └──────────┬───────────┘          └──────────┬───────────┘
//!            └───────────────┬─────────────────┘
//!                            ▼  CaptureListener
//!            ┌─────────────────────────────────┐
//!            │          CaptureSession          │
//!            │  ┌────────────┐ ┌─────────────┐ │
//!            │  │ TimerStore │ │ InternTable │ │
//!            │  │ (blocks)   │ │ (stacks...) │ │
//!            │  └────────────┘ └─────────────┘ │
//!            │  ┌─────────────────────────────┐ │
//!            │  │ AddressSpace (module sets)  │ │
//!            │  └─────────────────────────────┘ │
//!            └───────────────┬─────────────────┘
//!                            ▼
//!            ┌─────────────────────────────────┐
//!            │ analysis (function statistics)  │
//!            │ symbols (symbol tables, DWARF)  │
//!            └─────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core
//!
//! - [`store`]: append-only event block store, one chain per thread
//! - [`interning`]: content-addressed tables for call stacks, tracepoints and strings
//! - [`address_space`]: per-process module sets, `/proc` enumeration
//! - [`protocol`]: versioned capture file format, loader and writer
//! - [`listener`]: callback contract between decoders and consumers
//! - [`session`]: in-memory capture model and live orchestration
//!
//! ### Supporting Modules
//!
//! - [`symbols`]: symbol tables (`object`) and line information (`addr2line`)
//! - [`analysis`]: per-function timing statistics
//! - [`domain`]: newtypes, capture records and error enums
//! - [`cli`]: command-line argument parsing
//!
//! ## Key Concepts
//!
//! - **Timer**: one instrumented function call on one thread, `[start, end]` in ns
//! - **Intern key**: stable 64-bit key standing in for a repeated payload
//! - **Load bias**: offset between the file's virtual addresses and its mapping
//! - **Session id**: tags agent messages; older ids are stale and dropped

pub mod address_space;
pub mod analysis;
pub mod cli;
pub mod domain;
pub mod interning;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod store;
pub mod symbols;
