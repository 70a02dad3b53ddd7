//! Live capture orchestration
//!
//! The controller owns the agent connection and the current [`CaptureSession`].
//! Agent messages are queued by the transport's dispatch callback and applied to the
//! session by [`CaptureController::pump`] on the caller's thread, so the session is
//! never touched concurrently.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use super::capture_session::CaptureSession;
use super::transport::AgentTransport;
use crate::domain::{
    functions_by_address, CallStack, CallstackEvent, FunctionInfo, InternKey, Pid,
    ProcessDescriptor, SessionError, SessionId, ThreadStateSlice, Tid, TimedEvent,
    TracepointEvent,
};
use crate::listener::CaptureListener;
use loupe_common::{AgentCommand, AgentEvent, AgentMessage, HookKind, TracepointInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Recording,
}

/// Result of one [`CaptureController::pump`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// Nothing was waiting
    Idle,
    /// Messages of the current session applied
    Processed(usize),
    /// The agent finished flushing the current session
    Finished,
    /// The agent went away; the session was completed with what had arrived
    ConnectionLost,
}

pub struct CaptureController<T: AgentTransport> {
    transport: T,
    inbox: Receiver<AgentMessage>,
    connected: bool,
    state: ControllerState,
    target: Option<ProcessDescriptor>,
    functions: Vec<FunctionInfo>,
    tracepoints: BTreeSet<TracepointInfo>,
    last_session_id: SessionId,
    session: Option<CaptureSession>,
    /// Current session still expects `CaptureFinished`
    awaiting_finish: bool,
}

impl<T: AgentTransport> CaptureController<T> {
    pub fn new(mut transport: T) -> Self {
        let (tx, inbox) = unbounded();
        transport.set_dispatch(Box::new(move |message| {
            // Receiver gone means the controller was dropped
            let _ = tx.send(message);
        }));
        Self {
            transport,
            inbox,
            connected: true,
            state: ControllerState::Idle,
            target: None,
            functions: Vec::new(),
            tracepoints: BTreeSet::new(),
            last_session_id: SessionId(0),
            session: None,
            awaiting_finish: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn set_target(&mut self, process: Option<ProcessDescriptor>) {
        self.target = process;
    }

    #[must_use]
    pub fn target(&self) -> Option<&ProcessDescriptor> {
        self.target.as_ref()
    }

    /// Known functions of the target; those with `selected` set are instrumented.
    pub fn set_functions(&mut self, functions: Vec<FunctionInfo>) {
        self.functions = functions;
    }

    pub fn select_tracepoints(&mut self, tracepoints: BTreeSet<TracepointInfo>) {
        self.tracepoints = tracepoints;
    }

    /// Start recording the target with a fresh session.
    ///
    /// # Errors
    /// - [`SessionError::AlreadyRecording`] while a capture is running
    /// - [`SessionError::NoTargetProcess`] if no target was set
    /// - [`SessionError::ProducersActive`] if the previous session still has producers
    /// - [`SessionError::Transport`] if the agent is gone
    pub fn start_capture(&mut self) -> Result<SessionId, SessionError> {
        if self.state == ControllerState::Recording {
            return Err(SessionError::AlreadyRecording(self.last_session_id));
        }
        let target = self.target.clone().ok_or(SessionError::NoTargetProcess)?;
        if let Some(active) =
            self.session.as_ref().map(CaptureSession::active_producers).filter(|n| *n > 0)
        {
            return Err(SessionError::ProducersActive(active));
        }

        let id = self.last_session_id.next();
        let selected = functions_by_address(
            self.functions.iter().filter(|f| f.selected),
            &target.modules,
        );
        let mut session = CaptureSession::new(id);
        session.on_capture_started(target.clone(), selected.clone(), self.tracepoints.clone());

        let mut hooks: BTreeMap<HookKind, Vec<u64>> = BTreeMap::new();
        for (address, function) in &selected {
            hooks.entry(function.hook_kind).or_default().push(*address);
        }

        self.transport.send(AgentCommand::NewSession { session_id: id.0 })?;
        self.transport.send(AgentCommand::SelectTracepoints {
            tracepoints: self.tracepoints.iter().cloned().collect(),
        })?;
        for kind in HookKind::ALL {
            if let Some(mut addresses) = hooks.remove(&kind) {
                addresses.sort_unstable();
                self.transport.send(AgentCommand::InstallHooks {
                    message_type: kind.message_type(),
                    addresses,
                })?;
            }
        }
        self.transport.send(AgentCommand::StartCapture { pid: target.pid.0 })?;

        info!(
            "Started {id} on {} ({}): {} hooks, {} tracepoints",
            target.name,
            target.pid,
            selected.len(),
            self.tracepoints.len()
        );
        self.last_session_id = id;
        self.session = Some(session);
        self.state = ControllerState::Recording;
        self.awaiting_finish = true;
        Ok(id)
    }

    /// Ask the agent to stop. Does nothing unless recording.
    ///
    /// Events the agent flushes afterwards still reach the session until `pump`
    /// reports [`PumpStatus::Finished`].
    pub fn stop_capture(&mut self) {
        if self.state != ControllerState::Recording {
            return;
        }
        self.state = ControllerState::Idle;
        info!("Stopping {}", self.last_session_id);
        if let Err(err) = self.transport.send(AgentCommand::StopCapture) {
            warn!("Could not send stop to agent: {err}");
        }
    }

    /// Apply every queued agent message without blocking.
    pub fn pump(&mut self) -> PumpStatus {
        let mut processed = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(message) => {
                    if let Some(status) = self.apply(message, &mut processed) {
                        return status;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return self.disconnected(processed),
            }
        }
        if processed == 0 {
            PumpStatus::Idle
        } else {
            PumpStatus::Processed(processed)
        }
    }

    /// Wait up to `timeout` for a message of the current session, then drain the
    /// queue like [`Self::pump`].
    ///
    /// Stale messages do not count: if only those arrive before the deadline the
    /// result is [`PumpStatus::Idle`].
    pub fn pump_timeout(&mut self, timeout: Duration) -> PumpStatus {
        let deadline = Instant::now() + timeout;
        let mut processed = 0;
        while processed == 0 {
            match self.inbox.recv_deadline(deadline) {
                Ok(message) => {
                    if let Some(status) = self.apply(message, &mut processed) {
                        return status;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return PumpStatus::Idle,
                Err(RecvTimeoutError::Disconnected) => return self.disconnected(0),
            }
        }
        match self.pump() {
            PumpStatus::Idle => PumpStatus::Processed(processed),
            PumpStatus::Processed(more) => PumpStatus::Processed(processed + more),
            status => status,
        }
    }

    fn apply(&mut self, message: AgentMessage, processed: &mut usize) -> Option<PumpStatus> {
        let current = self.session.as_mut().filter(|s| s.id().0 == message.session_id);
        let Some(session) = current.filter(|_| self.awaiting_finish) else {
            debug!("Dropping message of stale session#{}", message.session_id);
            return None;
        };
        if message.event == AgentEvent::CaptureFinished {
            session.on_capture_complete();
            self.state = ControllerState::Idle;
            self.awaiting_finish = false;
            return Some(PumpStatus::Finished);
        }
        deliver(message.event, session);
        *processed += 1;
        None
    }

    fn disconnected(&mut self, processed: usize) -> PumpStatus {
        if !self.connected {
            return if processed == 0 {
                PumpStatus::Idle
            } else {
                PumpStatus::Processed(processed)
            };
        }
        self.connected = false;
        if self.awaiting_finish {
            warn!("Connection to agent lost during {}", self.last_session_id);
            if let Some(session) = self.session.as_mut() {
                session.on_capture_complete();
            }
        } else {
            warn!("Connection to agent lost");
        }
        self.state = ControllerState::Idle;
        self.awaiting_finish = false;
        PumpStatus::ConnectionLost
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut CaptureSession> {
        self.session.as_mut()
    }

    /// Hand the last session to the caller. Not possible while recording.
    pub fn take_session(&mut self) -> Option<CaptureSession> {
        if self.awaiting_finish {
            return None;
        }
        self.session.take()
    }
}

fn deliver(event: AgentEvent, listener: &mut dyn CaptureListener) {
    match event {
        AgentEvent::ThreadName { tid, name } => listener.on_thread_name(Tid(tid), name),
        AgentEvent::UniqueCallStack { key, frames } => {
            listener.on_unique_callstack(InternKey(key), CallStack::new(frames));
        }
        AgentEvent::CallstackSample { tid, timestamp_ns, callstack_key } => {
            listener.on_callstack_event(CallstackEvent {
                timestamp_ns,
                callstack_key: InternKey(callstack_key),
                tid: Tid(tid),
            });
        }
        AgentEvent::ContextSwitch { tid, begin_ns, end_ns, state } => {
            listener.on_thread_state_slice(ThreadStateSlice {
                tid: Tid(tid),
                state: state.into(),
                begin_ns,
                end_ns,
            });
        }
        AgentEvent::UniqueTracepoint { key, info } => {
            listener.on_unique_tracepoint_info(InternKey(key), info);
        }
        AgentEvent::Tracepoint { tid, pid, cpu, timestamp_ns, tracepoint_key } => {
            listener.on_tracepoint_event(TracepointEvent {
                tid: Tid(tid),
                pid: Pid(pid),
                cpu,
                timestamp_ns,
                tracepoint_key: InternKey(tracepoint_key),
            });
        }
        AgentEvent::KeyAndString { key, value } => listener.on_key_and_string(key, value),
        AgentEvent::Timer {
            tid,
            start_ns,
            end_ns,
            function_address,
            callstack_key,
            depth,
            user_data_key,
        } => listener.on_timer(TimedEvent {
            start: start_ns,
            end: end_ns,
            tid: Tid(tid),
            function_id: function_address,
            callstack: callstack_key.map(InternKey),
            depth,
            user_data_key,
        }),
        AgentEvent::CaptureFinished => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ModuleDescriptor, ThreadState, TransportError};
    use crate::session::{ChannelTransport, DispatchFn};
    use loupe_common::{MessageType, SwitchState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records commands instead of sending them
    #[derive(Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<AgentCommand>>>,
        refuse_start: Arc<AtomicBool>,
        dispatch: Option<DispatchFn>,
    }

    impl AgentTransport for RecordingTransport {
        fn send(&self, command: AgentCommand) -> Result<(), TransportError> {
            if self.refuse_start.load(Ordering::SeqCst)
                && matches!(command, AgentCommand::StartCapture { .. })
            {
                return Err(TransportError::Disconnected);
            }
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn set_dispatch(&mut self, dispatch: DispatchFn) {
            self.dispatch = Some(dispatch);
        }
    }

    fn target() -> ProcessDescriptor {
        let mut process = ProcessDescriptor::new(Pid(42), "game");
        process.modules.push(ModuleDescriptor {
            file_path: "/opt/game".into(),
            file_size: 1,
            build_id: String::new(),
            load_bias: 0,
            address_start: 0x10_0000,
            address_end: 0x20_0000,
        });
        process
    }

    fn selected(name: &str, address: u64) -> FunctionInfo {
        let mut function = FunctionInfo::new(name, name, "/opt/game", address, 16);
        function.selected = true;
        function
    }

    #[test]
    fn test_start_without_target() {
        let mut controller = CaptureController::new(RecordingTransport::default());
        assert!(matches!(controller.start_capture(), Err(SessionError::NoTargetProcess)));
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_hooks_are_batched_by_kind() {
        let transport = RecordingTransport::default();
        let sent = Arc::clone(&transport.sent);
        let mut controller = CaptureController::new(transport);
        controller.set_target(Some(target()));
        controller.set_functions(vec![
            selected("render", 0x200),
            selected("malloc", 0x300),
            selected("update", 0x100),
            FunctionInfo::new("idle", "idle", "/opt/game", 0x400, 4),
        ]);

        let id = controller.start_capture().unwrap();
        assert_eq!(id, SessionId(1));
        assert!(matches!(controller.start_capture(), Err(SessionError::AlreadyRecording(_))));

        let sent = sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![
                AgentCommand::NewSession { session_id: 1 },
                AgentCommand::SelectTracepoints { tracepoints: vec![] },
                AgentCommand::InstallHooks {
                    message_type: MessageType::FunctionHook,
                    addresses: vec![0x10_0100, 0x10_0200],
                },
                AgentCommand::InstallHooks {
                    message_type: MessageType::FunctionHookAlloc,
                    addresses: vec![0x10_0300],
                },
                AgentCommand::StartCapture { pid: 42 },
            ]
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport = RecordingTransport::default();
        let sent = Arc::clone(&transport.sent);
        let mut controller = CaptureController::new(transport);
        controller.stop_capture();
        controller.set_target(Some(target()));
        controller.start_capture().unwrap();
        controller.stop_capture();
        controller.stop_capture();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|c| **c == AgentCommand::StopCapture).count(), 1);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_events_reach_the_session() {
        let (transport, agent) = ChannelTransport::pair();
        let mut controller = CaptureController::new(transport);
        controller.set_target(Some(target()));
        let id = controller.start_capture().unwrap();

        agent.send(id.0, AgentEvent::ThreadName { tid: 7, name: "worker".into() }).unwrap();
        for (begin_ns, state) in
            [(0, SwitchState::Running), (5, SwitchState::Runnable), (9, SwitchState::Sleeping)]
        {
            let end_ns = begin_ns + 4;
            let switch = AgentEvent::ContextSwitch { tid: 7, begin_ns, end_ns, state };
            agent.send(id.0, switch).unwrap();
        }
        agent.send(id.0 + 100, AgentEvent::KeyAndString { key: 1, value: "x".into() }).unwrap();
        agent.send(id.0, AgentEvent::CaptureFinished).unwrap();

        loop {
            match controller.pump_timeout(Duration::from_secs(5)) {
                PumpStatus::Processed(_) => {}
                PumpStatus::Finished => break,
                status => panic!("unexpected {status:?}"),
            }
        }

        let session = controller.take_session().unwrap();
        assert_eq!(session.thread_name(Tid(7)), Some("worker"));
        let states: Vec<ThreadState> =
            session.thread_state_slices_of(Tid(7)).iter().map(|s| s.state).collect();
        let expected = vec![ThreadState::Running, ThreadState::Runnable, ThreadState::Sleeping];
        assert_eq!(states, expected);
        assert!(session.strings().is_empty());
    }

    #[test]
    fn test_only_stale_messages_leave_pump_idle() {
        let (transport, agent) = ChannelTransport::pair();
        let mut controller = CaptureController::new(transport);
        controller.set_target(Some(target()));
        let id = controller.start_capture().unwrap();

        agent.send(id.0 + 1, AgentEvent::ThreadName { tid: 1, name: "other".into() }).unwrap();
        agent.send(id.0 + 2, AgentEvent::KeyAndString { key: 1, value: "x".into() }).unwrap();

        assert_eq!(controller.pump_timeout(Duration::from_millis(200)), PumpStatus::Idle);
        assert_eq!(controller.pump(), PumpStatus::Idle);
        assert_eq!(controller.session().unwrap().thread_name(Tid(1)), None);
    }

    #[test]
    fn test_failed_start_keeps_previous_session() {
        let transport = RecordingTransport::default();
        let refuse_start = Arc::clone(&transport.refuse_start);
        let mut controller = CaptureController::new(transport);
        controller.set_target(Some(target()));
        let first = controller.start_capture().unwrap();
        controller.stop_capture();
        controller.session_mut().unwrap().on_capture_complete();

        let mut moved = target();
        moved.modules[0].file_path = "/opt/game-v2".into();
        controller.set_target(Some(moved));
        refuse_start.store(true, Ordering::SeqCst);

        assert!(matches!(controller.start_capture(), Err(SessionError::Transport(_))));
        assert_eq!(controller.state(), ControllerState::Idle);
        let session = controller.session().unwrap();
        assert_eq!(session.id(), first);
        assert_eq!(session.capture_info().unwrap().modules[0].file_path, "/opt/game");
    }
}
