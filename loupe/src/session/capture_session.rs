//! In-memory model of one capture.
//!
//! A `CaptureSession` is created fresh for every recording or replay and fed
//! through the [`CaptureListener`] contract. Nothing in it is shared with the
//! previous session: a new session means new interning tables, a new event store
//! and a new address-space snapshot.

use log::{error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::address_space::AddressSpace;
use crate::analysis::{FunctionHotspot, FunctionStats};
use crate::domain::{
    AddressInfo, CallStack, CallstackEvent, FunctionInfo, InternKey, ProcessDescriptor,
    SessionId, StoreError, ThreadStateSlice, Tid, TimedEvent, TracepointEvent,
};
use crate::interning::{CallstackTable, StringTable, TracepointTable};
use crate::listener::CaptureListener;
use crate::protocol::CaptureInfo;
use crate::store::{ThreadTimers, TimerStore};
use loupe_common::TracepointInfo;

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    Complete,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
pub struct CaptureSession {
    id: SessionId,
    process: Option<ProcessDescriptor>,
    selected_functions: HashMap<u64, FunctionInfo>,
    selected_tracepoints: BTreeSet<TracepointInfo>,
    address_space: Arc<AddressSpace>,
    callstacks: Arc<CallstackTable>,
    tracepoints: Arc<TracepointTable>,
    strings: Arc<StringTable>,
    address_infos: BTreeMap<u64, AddressInfo>,
    thread_names: BTreeMap<Tid, String>,
    thread_state_slices: BTreeMap<Tid, Vec<ThreadStateSlice>>,
    callstack_events: Vec<CallstackEvent>,
    tracepoint_events: Vec<TracepointEvent>,
    timers: TimerStore,
    stats: FunctionStats,
    outcome: Option<SessionOutcome>,
    fatal: Option<StoreError>,
    /// One clone per live [`Producer`]
    producers: Arc<()>,
}

impl CaptureSession {
    /// An empty session with its own address-space model
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            process: None,
            selected_functions: HashMap::new(),
            selected_tracepoints: BTreeSet::new(),
            address_space: Arc::new(AddressSpace::new()),
            callstacks: Arc::new(CallstackTable::new()),
            tracepoints: Arc::new(TracepointTable::new()),
            strings: Arc::new(StringTable::new()),
            address_infos: BTreeMap::new(),
            thread_names: BTreeMap::new(),
            thread_state_slices: BTreeMap::new(),
            callstack_events: Vec::new(),
            tracepoint_events: Vec::new(),
            timers: TimerStore::new(),
            stats: FunctionStats::new(),
            outcome: None,
            fatal: None,
            producers: Arc::new(()),
        }
    }

    /// A session for replaying a file
    #[must_use]
    pub fn for_replay() -> Self {
        Self::new(SessionId(0))
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn process(&self) -> Option<&ProcessDescriptor> {
        self.process.as_ref()
    }

    #[must_use]
    pub fn selected_functions(&self) -> &HashMap<u64, FunctionInfo> {
        &self.selected_functions
    }

    #[must_use]
    pub fn selected_tracepoints(&self) -> &BTreeSet<TracepointInfo> {
        &self.selected_tracepoints
    }

    #[must_use]
    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    #[must_use]
    pub fn callstacks(&self) -> &CallstackTable {
        &self.callstacks
    }

    #[must_use]
    pub fn tracepoints(&self) -> &TracepointTable {
        &self.tracepoints
    }

    #[must_use]
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Address infos ordered by address
    pub fn address_infos(&self) -> impl Iterator<Item = &AddressInfo> + '_ {
        self.address_infos.values()
    }

    #[must_use]
    pub fn address_info(&self, absolute_address: u64) -> Option<&AddressInfo> {
        self.address_infos.get(&absolute_address)
    }

    pub fn thread_names(&self) -> impl Iterator<Item = (Tid, &str)> + '_ {
        self.thread_names.iter().map(|(tid, name)| (*tid, name.as_str()))
    }

    #[must_use]
    pub fn thread_name(&self, tid: Tid) -> Option<&str> {
        self.thread_names.get(&tid).map(String::as_str)
    }

    /// Thread-state slices grouped by thread, each thread in arrival order
    pub fn thread_state_slices(&self) -> impl Iterator<Item = &ThreadStateSlice> + '_ {
        self.thread_state_slices.values().flatten()
    }

    #[must_use]
    pub fn thread_state_slices_of(&self, tid: Tid) -> &[ThreadStateSlice] {
        self.thread_state_slices.get(&tid).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn callstack_events(&self) -> &[CallstackEvent] {
        &self.callstack_events
    }

    #[must_use]
    pub fn tracepoint_events(&self) -> &[TracepointEvent] {
        &self.tracepoint_events
    }

    #[must_use]
    pub fn timers(&self) -> &TimerStore {
        &self.timers
    }

    #[must_use]
    pub fn function_stats(&self) -> &FunctionStats {
        &self.stats
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    /// Allocation failure that tore this session down, if any
    #[must_use]
    pub fn fatal_error(&self) -> Option<&StoreError> {
        self.fatal.as_ref()
    }

    /// Metadata message describing this session, once it has started
    #[must_use]
    pub fn capture_info(&self) -> Option<CaptureInfo> {
        let process = self.process.clone()?;
        let modules = self
            .address_space
            .module_set(process.pid)
            .map_or_else(|| process.modules.clone(), |set| set.modules().to_vec());
        let mut selected_functions: Vec<FunctionInfo> =
            self.selected_functions.values().cloned().collect();
        selected_functions
            .sort_by(|a, b| (&a.module_path, a.address).cmp(&(&b.module_path, b.address)));
        Some(CaptureInfo {
            process,
            modules,
            selected_functions,
            tracepoint_infos: self.selected_tracepoints.iter().cloned().collect(),
        })
    }

    /// Private timer buffer for a thread recording in parallel with others.
    ///
    /// # Errors
    /// Returns an error if the buffer's first block cannot be allocated
    pub fn producer(&self, tid: Tid) -> Result<Producer, StoreError> {
        Ok(Producer {
            timers: ThreadTimers::new(tid)?,
            callstacks: Arc::clone(&self.callstacks),
            _token: Arc::clone(&self.producers),
        })
    }

    /// Number of producers handed out and not yet absorbed or dropped
    #[must_use]
    pub fn active_producers(&self) -> usize {
        Arc::strong_count(&self.producers) - 1
    }

    /// Merge a finished producer into the session.
    ///
    /// # Errors
    /// Returns the allocation failure that tore the session down
    pub fn absorb(&mut self, producer: Producer) -> Result<(), StoreError> {
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }
        let Producer { timers, .. } = producer;
        for timer in timers.iter() {
            self.stats.record(timer);
        }
        self.timers.absorb(timers).map_err(|err| self.tear_down(err))
    }

    fn tear_down(&mut self, err: StoreError) -> StoreError {
        error!("{err}; capture {} is torn down", self.id);
        self.timers = TimerStore::new();
        self.stats = FunctionStats::new();
        self.outcome = Some(SessionOutcome::Failed(err.to_string()));
        self.fatal = Some(err.clone());
        err
    }

    fn accepting(&self) -> bool {
        self.fatal.is_none()
    }

    /// Top functions by total time
    #[must_use]
    pub fn hotspots(&self, limit: usize) -> Vec<FunctionHotspot> {
        self.stats.hotspots(&self.selected_functions, limit)
    }

    #[must_use]
    pub fn summary(&self, top: usize) -> CaptureSummary {
        CaptureSummary {
            process: self.process.as_ref().map(|p| p.name.clone()),
            pid: self.process.as_ref().map(|p| p.pid.0),
            modules: self.process.as_ref().map_or(0, |p| p.modules.len()),
            threads: self.timers.threads().count().max(self.thread_names.len()),
            timers: self.timers.len(),
            unique_callstacks: self.callstacks.len(),
            callstack_events: self.callstack_events.len(),
            tracepoint_events: self.tracepoint_events.len(),
            thread_state_slices: self.thread_state_slices.values().map(Vec::len).sum(),
            outcome: self.outcome.clone(),
            top_functions: self.hotspots(top),
        }
    }
}

/// Counts and top functions of a session, for reports.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub process: Option<String>,
    pub pid: Option<u32>,
    pub modules: usize,
    pub threads: usize,
    pub timers: u64,
    pub unique_callstacks: usize,
    pub callstack_events: usize,
    pub tracepoint_events: usize,
    pub thread_state_slices: usize,
    pub outcome: Option<SessionOutcome>,
    pub top_functions: Vec<FunctionHotspot>,
}

/// Timer buffer owned by one producer thread.
///
/// Keeps its session from starting a successor until it is absorbed or dropped.
#[derive(Debug)]
pub struct Producer {
    timers: ThreadTimers,
    callstacks: Arc<CallstackTable>,
    _token: Arc<()>,
}

impl Producer {
    /// # Errors
    /// Returns an error if a block cannot be allocated
    pub fn record(&mut self, timer: TimedEvent) -> Result<(), StoreError> {
        self.timers.record(timer)
    }

    /// Intern a call stack in the session's shared table
    pub fn intern_callstack(&self, callstack: CallStack) -> InternKey {
        self.callstacks.intern(callstack)
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.timers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl CaptureListener for CaptureSession {
    fn on_capture_started(
        &mut self,
        process: ProcessDescriptor,
        selected_functions: HashMap<u64, FunctionInfo>,
        selected_tracepoints: BTreeSet<TracepointInfo>,
    ) {
        info!(
            "Capture {} started: {} ({}), {} modules, {} functions, {} tracepoints",
            self.id,
            process.name,
            process.pid,
            process.modules.len(),
            selected_functions.len(),
            selected_tracepoints.len()
        );
        self.address_space.update_modules(process.pid, process.modules.clone());
        self.process = Some(process);
        self.selected_functions = selected_functions;
        self.selected_tracepoints = selected_tracepoints;
    }

    fn on_address_info(&mut self, info: AddressInfo) {
        if self.accepting() {
            self.address_infos.insert(info.absolute_address, info);
        }
    }

    fn on_thread_name(&mut self, tid: Tid, name: String) {
        if self.accepting() {
            self.thread_names.insert(tid, name);
        }
    }

    fn on_thread_state_slice(&mut self, slice: ThreadStateSlice) {
        if self.accepting() {
            self.thread_state_slices.entry(slice.tid).or_default().push(slice);
        }
    }

    fn on_unique_callstack(&mut self, key: InternKey, callstack: CallStack) {
        if let Err(err) = self.callstacks.publish(key, callstack) {
            warn!("Dropping call stack: {err}");
        }
    }

    fn on_callstack_event(&mut self, mut event: CallstackEvent) {
        if !self.accepting() {
            return;
        }
        let Some(key) = self.callstacks.translate(event.callstack_key) else {
            warn!("Dropping sample of unknown call stack {}", event.callstack_key);
            return;
        };
        event.callstack_key = key;
        self.callstack_events.push(event);
    }

    fn on_unique_tracepoint_info(&mut self, key: InternKey, info: TracepointInfo) {
        if let Err(err) = self.tracepoints.publish(key, info) {
            warn!("Dropping tracepoint info: {err}");
        }
    }

    fn on_tracepoint_event(&mut self, mut event: TracepointEvent) {
        if !self.accepting() {
            return;
        }
        let Some(key) = self.tracepoints.translate(event.tracepoint_key) else {
            warn!("Dropping event of unknown tracepoint {}", event.tracepoint_key);
            return;
        };
        event.tracepoint_key = key;
        self.tracepoint_events.push(event);
    }

    fn on_key_and_string(&mut self, key: u64, value: String) {
        if let Err(err) = self.strings.publish(InternKey(key), value) {
            warn!("Dropping string: {err}");
        }
    }

    fn on_timer(&mut self, mut timer: TimedEvent) {
        if !self.accepting() {
            return;
        }
        timer.callstack = timer.callstack.and_then(|key| self.callstacks.translate(key));
        timer.user_data_key = timer
            .user_data_key
            .and_then(|key| self.strings.translate(InternKey(key)))
            .map(|key| key.0);
        let recorded = timer.clone();
        match self.timers.append(timer) {
            Ok(()) => self.stats.record(&recorded),
            Err(err) => {
                self.tear_down(err);
            }
        }
    }

    fn on_capture_complete(&mut self) {
        if self.accepting() {
            info!("Capture {} complete: {} timers", self.id, self.timers.len());
            self.outcome = Some(SessionOutcome::Complete);
        }
    }

    fn on_capture_cancelled(&mut self) {
        if self.accepting() {
            info!("Capture {} cancelled", self.id);
            self.outcome = Some(SessionOutcome::Cancelled);
        }
    }

    fn on_capture_failed(&mut self, error_message: String) {
        if self.accepting() {
            self.outcome = Some(SessionOutcome::Failed(error_message));
        }
    }
}
