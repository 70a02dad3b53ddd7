//! Domain model for loupe
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling
//! - The capture payload records shared by the store, the protocol and the session

pub mod errors;
pub mod records;
pub mod types;

// Re-export common types for convenience
pub use types::{ns_to_ms, InternKey, Pid, SessionId, Tid, TimestampNs};

pub use errors::{
    AddressSpaceError, CaptureLoadError, FrameError, InternError, SessionError, StoreError,
    SymbolError, TransportError,
};
pub use records::{
    functions_by_address, AddressInfo, CallStack, CallstackEvent, FunctionInfo,
    ModuleDescriptor, ProcessDescriptor, ThreadState, ThreadStateSlice, TimedEvent,
    TracepointEvent,
};
