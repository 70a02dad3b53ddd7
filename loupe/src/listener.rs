//! # Capture Listener
//!
//! The callback contract through which decoded capture data reaches its
//! consumers. Both the file loader ([`crate::protocol::load_capture`]) and the live
//! controller ([`crate::session::CaptureController`]) push into a
//! `&mut dyn CaptureListener`; neither knows the concrete consumer.
//!
//! ## Ordering
//!
//! 1. `on_capture_started` exactly once, before any event
//! 2. any number of event callbacks, in stream order
//! 3. exactly one of `on_capture_complete`, `on_capture_cancelled` or
//!    `on_capture_failed`
//!
//! A load that fails before the metadata phase calls only `on_capture_failed`.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{
    AddressInfo, CallStack, CallstackEvent, FunctionInfo, InternKey, ProcessDescriptor,
    ThreadStateSlice, Tid, TimedEvent, TracepointEvent,
};
use loupe_common::TracepointInfo;

pub trait CaptureListener {
    /// Target process with its module list, and the instrumented functions keyed by
    /// absolute address.
    fn on_capture_started(
        &mut self,
        process: ProcessDescriptor,
        selected_functions: HashMap<u64, FunctionInfo>,
        selected_tracepoints: BTreeSet<TracepointInfo>,
    );
    fn on_address_info(&mut self, info: AddressInfo);
    fn on_thread_name(&mut self, tid: Tid, name: String);
    fn on_thread_state_slice(&mut self, slice: ThreadStateSlice);
    fn on_unique_callstack(&mut self, key: InternKey, callstack: CallStack);
    fn on_callstack_event(&mut self, event: CallstackEvent);
    fn on_unique_tracepoint_info(&mut self, key: InternKey, info: TracepointInfo);
    fn on_tracepoint_event(&mut self, event: TracepointEvent);
    fn on_key_and_string(&mut self, key: u64, value: String);
    fn on_timer(&mut self, timer: TimedEvent);

    fn on_capture_complete(&mut self);
    fn on_capture_cancelled(&mut self);
    /// `error_message` is meant for users and names the source of the capture.
    fn on_capture_failed(&mut self, error_message: String);
}
