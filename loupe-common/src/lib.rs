//! # Shared Data Structures (Agent ↔ Client)
//!
//! Defines the messages and constants shared between a live capture agent running
//! next to the target process and the client that records its events. Both sides
//! must agree on these definitions, so they live in their own crate with no
//! dependencies beyond `serde`.
//!
//! ## Key Types
//!
//! - [`HookKind`] - Classification of an instrumented function
//! - [`MessageType`] - Wire message type that carries a batch of hook addresses
//! - [`AgentCommand`] - Client → agent commands
//! - [`AgentEvent`] / [`AgentMessage`] - Agent → client event stream
//!
//! ## Capture Format
//!
//! [`CAPTURE_FORMAT_VERSION`] is the single capture file version this build reads
//! and writes. Files declaring any other version are rejected outright.

use serde::{Deserialize, Serialize};

// ============================================================================
// Capture Format Constants
// ============================================================================

/// Version string written into (and required from) every capture file header.
pub const CAPTURE_FORMAT_VERSION: &str = "1.59";

/// File extension used for saved captures.
pub const CAPTURE_FILE_EXTENSION: &str = "loupe";

/// Number of bytes of the little-endian length prefix in front of every message.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on a single framed payload (1 GiB).
///
/// Metadata messages of large processes can reach tens of megabytes; anything
/// beyond this bound is a corrupted length prefix.
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;

// ============================================================================
// Hook Classification
// ============================================================================

/// The kind of hook installed on an instrumented function.
///
/// Every selected function falls into exactly one kind. Hooks of the same kind
/// are always sent to the agent as one batched message (see [`MessageType`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookKind {
    /// Plain entry/exit hook producing one timer per call
    Entry,
    /// Start of a manually instrumented zone
    ZoneStart,
    /// End of a manually instrumented zone
    ZoneStop,
    /// Memory allocation (`malloc` family)
    Alloc,
    /// Memory release (`free` family)
    Free,
    /// Memory reallocation
    Realloc,
    /// Debug string output
    DebugString,
    /// Custom user data attached to the current zone
    CustomData,
}

impl HookKind {
    /// All hook kinds, in the order their batches are sent to the agent.
    pub const ALL: [HookKind; 8] = [
        HookKind::Entry,
        HookKind::ZoneStart,
        HookKind::ZoneStop,
        HookKind::Alloc,
        HookKind::Free,
        HookKind::Realloc,
        HookKind::DebugString,
        HookKind::CustomData,
    ];

    /// Classify a function by its (demangled) name.
    ///
    /// Manual instrumentation entry points and well-known allocator symbols get
    /// dedicated hook kinds; everything else is a plain entry hook.
    #[must_use]
    pub fn from_function_name(name: &str) -> Self {
        match name {
            "loupe_zone_start" | "loupe::zone_start" => HookKind::ZoneStart,
            "loupe_zone_stop" | "loupe::zone_stop" => HookKind::ZoneStop,
            "loupe_data" | "loupe::data" => HookKind::CustomData,
            "malloc" | "calloc" | "aligned_alloc" | "operator new(unsigned long)" => {
                HookKind::Alloc
            }
            "free" | "operator delete(void*)" => HookKind::Free,
            "realloc" => HookKind::Realloc,
            "OutputDebugStringA" | "loupe_debug_string" => HookKind::DebugString,
            _ => HookKind::Entry,
        }
    }

    /// Wire message type carrying the address list for this kind.
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            HookKind::Entry => MessageType::FunctionHook,
            HookKind::ZoneStart => MessageType::FunctionHookZoneStart,
            HookKind::ZoneStop => MessageType::FunctionHookZoneStop,
            HookKind::Alloc => MessageType::FunctionHookAlloc,
            HookKind::Free => MessageType::FunctionHookFree,
            HookKind::Realloc => MessageType::FunctionHookRealloc,
            HookKind::DebugString => MessageType::FunctionHookDebugString,
            HookKind::CustomData => MessageType::FunctionHookCustomData,
        }
    }
}

/// Wire message types understood by the agent for hook installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    FunctionHook = 1,
    FunctionHookZoneStart = 2,
    FunctionHookZoneStop = 3,
    FunctionHookAlloc = 4,
    FunctionHookFree = 5,
    FunctionHookRealloc = 6,
    FunctionHookDebugString = 7,
    FunctionHookCustomData = 8,
}

// ============================================================================
// Client → Agent
// ============================================================================

/// A (category, name) pair identifying a kernel or user tracepoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TracepointInfo {
    pub category: String,
    pub name: String,
}

impl TracepointInfo {
    #[must_use]
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self { category: category.into(), name: name.into() }
    }
}

/// Commands sent from the client to a live agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentCommand {
    /// Open a new session; events tagged with older ids are stale from now on.
    NewSession { session_id: u64 },
    /// One batch of hook addresses, all of the same [`HookKind`].
    InstallHooks { message_type: MessageType, addresses: Vec<u64> },
    /// Tracepoints the agent should enable.
    SelectTracepoints { tracepoints: Vec<TracepointInfo> },
    /// Begin recording the given process.
    StartCapture { pid: u32 },
    /// Stop recording and flush outstanding events.
    StopCapture,
}

// ============================================================================
// Agent → Client
// ============================================================================

/// Scheduling state reported for one context-switch interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchState {
    /// On a CPU
    Running,
    /// Preempted, waiting for a CPU
    Runnable,
    /// Blocked, off the run queue
    Sleeping,
}

/// Events streamed from a live agent while recording.
///
/// These mirror the streamed event messages of a capture file so the client can
/// drive the same listener contract from either source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    ThreadName { tid: u32, name: String },
    UniqueCallStack { key: u64, frames: Vec<u64> },
    CallstackSample { tid: u32, timestamp_ns: u64, callstack_key: u64 },
    ContextSwitch { tid: u32, begin_ns: u64, end_ns: u64, state: SwitchState },
    UniqueTracepoint { key: u64, info: TracepointInfo },
    Tracepoint { tid: u32, pid: u32, cpu: u16, timestamp_ns: u64, tracepoint_key: u64 },
    KeyAndString { key: u64, value: String },
    Timer {
        tid: u32,
        start_ns: u64,
        end_ns: u64,
        function_address: u64,
        callstack_key: Option<u64>,
        depth: u8,
        user_data_key: Option<u64>,
    },
    /// The agent finished flushing after `StopCapture`.
    CaptureFinished,
}

/// An [`AgentEvent`] tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub session_id: u64,
    pub event: AgentEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_hook_kind_has_a_distinct_message_type() {
        let mut types: Vec<u8> =
            HookKind::ALL.iter().map(|kind| kind.message_type() as u8).collect();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), HookKind::ALL.len());
    }

    #[test]
    fn test_classify_function_names() {
        assert_eq!(HookKind::from_function_name("loupe_zone_start"), HookKind::ZoneStart);
        assert_eq!(HookKind::from_function_name("loupe_zone_stop"), HookKind::ZoneStop);
        assert_eq!(HookKind::from_function_name("malloc"), HookKind::Alloc);
        assert_eq!(HookKind::from_function_name("free"), HookKind::Free);
        assert_eq!(HookKind::from_function_name("realloc"), HookKind::Realloc);
        assert_eq!(HookKind::from_function_name("my_app::render"), HookKind::Entry);
    }
}
