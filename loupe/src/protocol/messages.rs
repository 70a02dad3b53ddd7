//! Capture file message payloads

use serde::{Deserialize, Serialize};

use crate::domain::{
    AddressInfo, CallStack, CallstackEvent, FunctionInfo, InternKey, ModuleDescriptor,
    ProcessDescriptor, ThreadStateSlice, Tid, TimedEvent, TracepointEvent,
};
use crate::listener::CaptureListener;
use loupe_common::{TracepointInfo, CAPTURE_FORMAT_VERSION};

/// First message of every capture file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub version: String,
}

impl CaptureHeader {
    /// Header declaring the version this build writes
    #[must_use]
    pub fn current() -> Self {
        Self { version: CAPTURE_FORMAT_VERSION.to_string() }
    }
}

/// Second message: everything needed to interpret the events that follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub process: ProcessDescriptor,
    pub modules: Vec<ModuleDescriptor>,
    pub selected_functions: Vec<FunctionInfo>,
    pub tracepoint_infos: Vec<TracepointInfo>,
}

/// One streamed event message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureEvent {
    AddressInfo(AddressInfo),
    ThreadName { tid: Tid, name: String },
    ThreadStateSlice(ThreadStateSlice),
    UniqueCallStack { key: InternKey, callstack: CallStack },
    CallstackEvent(CallstackEvent),
    UniqueTracepointInfo { key: InternKey, info: TracepointInfo },
    TracepointEvent(TracepointEvent),
    KeyAndString { key: u64, value: String },
    Timer(TimedEvent),
}

impl CaptureEvent {
    /// Hand the event to the matching listener callback.
    pub fn deliver(self, listener: &mut dyn CaptureListener) {
        match self {
            CaptureEvent::AddressInfo(info) => listener.on_address_info(info),
            CaptureEvent::ThreadName { tid, name } => listener.on_thread_name(tid, name),
            CaptureEvent::ThreadStateSlice(slice) => listener.on_thread_state_slice(slice),
            CaptureEvent::UniqueCallStack { key, callstack } => {
                listener.on_unique_callstack(key, callstack);
            }
            CaptureEvent::CallstackEvent(event) => listener.on_callstack_event(event),
            CaptureEvent::UniqueTracepointInfo { key, info } => {
                listener.on_unique_tracepoint_info(key, info);
            }
            CaptureEvent::TracepointEvent(event) => listener.on_tracepoint_event(event),
            CaptureEvent::KeyAndString { key, value } => listener.on_key_and_string(key, value),
            CaptureEvent::Timer(timer) => listener.on_timer(timer),
        }
    }
}
