//! Capture file replay
//!
//! ```text
//!  Idle ──▶ Loading ──┬──▶ Complete   (end of stream at a message boundary)
//!                     ├──▶ Failed     (unreadable, unsupported version, malformed)
//!                     └──▶ Cancelled  (token observed before a unit of work)
//! ```

use log::{error, info};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use super::cancellation::CancellationToken;
use super::framing::read_message;
use super::messages::{CaptureEvent, CaptureHeader, CaptureInfo};
use crate::domain::{functions_by_address, CaptureLoadError};
use crate::listener::CaptureListener;
use loupe_common::CAPTURE_FORMAT_VERSION;

/// Terminal state of a capture load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Complete,
    Failed,
    Cancelled,
}

/// Load the capture file at `path` into `listener`.
///
/// Every failure is reported through `on_capture_failed` and logged; this function
/// itself never fails.
pub fn load_capture(
    path: &Path,
    listener: &mut dyn CaptureListener,
    cancel: &CancellationToken,
) -> LoadState {
    let file_name = path.display().to_string();
    info!("Loading capture from \"{file_name}\"");
    if cancel.is_cancelled() {
        return cancelled(listener);
    }
    match File::open(path) {
        Ok(file) => load_from_reader(BufReader::new(file), &file_name, listener, cancel),
        Err(err) => fail(listener, &CaptureLoadError::Open { file: file_name }, &err),
    }
}

/// Decode a capture from any byte stream; `file_name` is only used in messages.
pub fn load_from_reader<R: Read>(
    mut reader: R,
    file_name: &str,
    listener: &mut dyn CaptureListener,
    cancel: &CancellationToken,
) -> LoadState {
    let malformed = || CaptureLoadError::Malformed { file: file_name.to_string() };

    if cancel.is_cancelled() {
        return cancelled(listener);
    }
    let header: CaptureHeader = match read_message(&mut reader) {
        Ok(Some(header)) => header,
        Ok(None) => return fail(listener, &malformed(), &"file is empty"),
        Err(err) => return fail(listener, &malformed(), &err),
    };
    if header.version != CAPTURE_FORMAT_VERSION {
        let err = CaptureLoadError::UnsupportedVersion {
            file: file_name.to_string(),
            found: header.version,
            supported: CAPTURE_FORMAT_VERSION.to_string(),
        };
        return fail(listener, &err, &"version mismatch");
    }

    if cancel.is_cancelled() {
        return cancelled(listener);
    }
    let info: CaptureInfo = match read_message(&mut reader) {
        Ok(Some(info)) => info,
        Ok(None) => return fail(listener, &malformed(), &"capture info is missing"),
        Err(err) => return fail(listener, &malformed(), &err),
    };
    start_capture(info, listener);

    let mut num_events: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            info!("Loading \"{file_name}\" cancelled after {num_events} events");
            return cancelled(listener);
        }
        match read_message::<_, CaptureEvent>(&mut reader) {
            Ok(Some(event)) => {
                event.deliver(listener);
                num_events += 1;
            }
            Ok(None) => {
                info!("Loaded {num_events} events from \"{file_name}\"");
                listener.on_capture_complete();
                return LoadState::Complete;
            }
            Err(err) => return fail(listener, &malformed(), &err),
        }
    }
}

fn start_capture(info: CaptureInfo, listener: &mut dyn CaptureListener) {
    let CaptureInfo { mut process, modules, selected_functions, tracepoint_infos } = info;
    let functions = functions_by_address(&selected_functions, &modules);
    process.modules = modules;
    let tracepoints: BTreeSet<_> = tracepoint_infos.into_iter().collect();
    listener.on_capture_started(process, functions, tracepoints);
}

fn cancelled(listener: &mut dyn CaptureListener) -> LoadState {
    listener.on_capture_cancelled();
    LoadState::Cancelled
}

fn fail(
    listener: &mut dyn CaptureListener,
    err: &CaptureLoadError,
    cause: &dyn Display,
) -> LoadState {
    error!("{err} ({cause})");
    listener.on_capture_failed(err.to_string());
    LoadState::Failed
}

/// Run [`load_capture`] on a background thread.
///
/// The listener is handed back together with the terminal state when the thread
/// is joined.
///
/// # Errors
/// Returns an error if the thread cannot be spawned
pub fn spawn_load<L>(
    path: PathBuf,
    mut listener: L,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<(L, LoadState)>>
where
    L: CaptureListener + Send + 'static,
{
    std::thread::Builder::new().name("capture-loader".to_string()).spawn(move || {
        let state = load_capture(&path, &mut listener, &cancel);
        (listener, state)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AddressInfo, CallStack, CallstackEvent, FunctionInfo, InternKey, ProcessDescriptor,
        ThreadStateSlice, Tid, TimedEvent, TracepointEvent,
    };
    use crate::protocol::framing::write_message;
    use loupe_common::TracepointInfo;
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Records callback names in order
    #[derive(Default)]
    struct CallLog {
        calls: Vec<String>,
        cancel_after_timers: Option<(usize, CancellationToken)>,
    }

    impl CaptureListener for CallLog {
        fn on_capture_started(
            &mut self,
            process: ProcessDescriptor,
            selected_functions: HashMap<u64, FunctionInfo>,
            _: BTreeSet<TracepointInfo>,
        ) {
            self.calls.push(format!("started:{}:{}", process.name, selected_functions.len()));
        }
        fn on_address_info(&mut self, _: AddressInfo) {
            self.calls.push("address_info".into());
        }
        fn on_thread_name(&mut self, _: Tid, name: String) {
            self.calls.push(format!("thread_name:{name}"));
        }
        fn on_thread_state_slice(&mut self, _: ThreadStateSlice) {
            self.calls.push("slice".into());
        }
        fn on_unique_callstack(&mut self, _: InternKey, _: CallStack) {
            self.calls.push("callstack".into());
        }
        fn on_callstack_event(&mut self, _: CallstackEvent) {
            self.calls.push("callstack_event".into());
        }
        fn on_unique_tracepoint_info(&mut self, _: InternKey, _: TracepointInfo) {
            self.calls.push("tracepoint_info".into());
        }
        fn on_tracepoint_event(&mut self, _: TracepointEvent) {
            self.calls.push("tracepoint_event".into());
        }
        fn on_key_and_string(&mut self, _: u64, _: String) {
            self.calls.push("string".into());
        }
        fn on_timer(&mut self, _: TimedEvent) {
            self.calls.push("timer".into());
            if let Some((limit, token)) = &self.cancel_after_timers {
                if self.calls.iter().filter(|c| *c == "timer").count() == *limit {
                    token.cancel();
                }
            }
        }
        fn on_capture_complete(&mut self) {
            self.calls.push("complete".into());
        }
        fn on_capture_cancelled(&mut self) {
            self.calls.push("cancelled".into());
        }
        fn on_capture_failed(&mut self, message: String) {
            self.calls.push(format!("failed:{message}"));
        }
    }

    fn info() -> CaptureInfo {
        CaptureInfo {
            process: ProcessDescriptor::new(crate::domain::Pid(42), "app"),
            modules: Vec::new(),
            selected_functions: Vec::new(),
            tracepoint_infos: Vec::new(),
        }
    }

    fn timer(start: u64) -> CaptureEvent {
        CaptureEvent::Timer(TimedEvent {
            start,
            end: start + 1,
            tid: Tid(1),
            function_id: 0,
            callstack: None,
            depth: 0,
            user_data_key: None,
        })
    }

    fn capture(version: &str, events: &[CaptureEvent]) -> Vec<u8> {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &CaptureHeader { version: version.to_string() }).unwrap();
        write_message(&mut buffer, &info()).unwrap();
        for event in events {
            write_message(&mut buffer, event).unwrap();
        }
        buffer
    }

    #[test]
    fn test_events_are_delivered_in_order() {
        let events = vec![
            CaptureEvent::ThreadName { tid: Tid(1), name: "main".into() },
            timer(1),
            CaptureEvent::KeyAndString { key: 3, value: "x".into() },
        ];
        let mut log = CallLog::default();
        let state = load_from_reader(
            Cursor::new(capture(CAPTURE_FORMAT_VERSION, &events)),
            "test.loupe",
            &mut log,
            &CancellationToken::new(),
        );
        assert_eq!(state, LoadState::Complete);
        assert_eq!(
            log.calls,
            vec!["started:app:0", "thread_name:main", "timer", "string", "complete"]
        );
    }

    #[test]
    fn test_version_mismatch_fails_without_other_callbacks() {
        let mut log = CallLog::default();
        let state = load_from_reader(
            Cursor::new(capture("0.1", &[timer(1)])),
            "old.loupe",
            &mut log,
            &CancellationToken::new(),
        );
        assert_eq!(state, LoadState::Failed);
        assert_eq!(log.calls.len(), 1);
        assert!(log.calls[0].contains("0.1"));
        assert!(log.calls[0].contains(CAPTURE_FORMAT_VERSION));
    }

    #[test]
    fn test_empty_input_is_malformed() {
        let mut log = CallLog::default();
        let token = CancellationToken::new();
        let state = load_from_reader(Cursor::new(Vec::new()), "empty.loupe", &mut log, &token);
        assert_eq!(state, LoadState::Failed);
        assert!(log.calls[0].starts_with("failed:Error parsing the capture from \"empty.loupe\""));
    }

    #[test]
    fn test_cancel_before_load_reports_only_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let mut log = CallLog::default();
        let state = load_from_reader(
            Cursor::new(capture(CAPTURE_FORMAT_VERSION, &[timer(1)])),
            "test.loupe",
            &mut log,
            &token,
        );
        assert_eq!(state, LoadState::Cancelled);
        assert_eq!(log.calls, vec!["cancelled"]);
    }

    #[test]
    fn test_cancel_mid_stream_stops_at_next_message() {
        let events: Vec<_> = (0..1000).map(timer).collect();
        let token = CancellationToken::new();
        let mut log = CallLog { calls: Vec::new(), cancel_after_timers: Some((5, token.clone())) };
        let state = load_from_reader(
            Cursor::new(capture(CAPTURE_FORMAT_VERSION, &events)),
            "big.loupe",
            &mut log,
            &token,
        );
        assert_eq!(state, LoadState::Cancelled);
        assert_eq!(log.calls.iter().filter(|c| *c == "timer").count(), 5);
        assert_eq!(log.calls.last().unwrap(), "cancelled");
    }

    #[test]
    fn test_missing_file() {
        let mut log = CallLog::default();
        let state = load_capture(
            Path::new("/no/such/capture.loupe"),
            &mut log,
            &CancellationToken::new(),
        );
        assert_eq!(state, LoadState::Failed);
        assert_eq!(
            log.calls,
            vec!["failed:Error opening file \"/no/such/capture.loupe\" for reading"]
        );
    }

    #[test]
    fn test_spawn_load_hands_listener_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.loupe");
        std::fs::write(&path, capture(CAPTURE_FORMAT_VERSION, &[timer(1), timer(2)])).unwrap();

        let handle = spawn_load(path, CallLog::default(), CancellationToken::new()).unwrap();
        let (log, state) = handle.join().unwrap();

        assert_eq!(state, LoadState::Complete);
        assert_eq!(log.calls, vec!["started:app:0", "timer", "timer", "complete"]);
    }
}
