//! Capture file writing

use chrono::{DateTime, Local};
use log::info;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::framing::write_message;
use super::messages::{CaptureEvent, CaptureHeader, CaptureInfo};
use crate::domain::{CallStack, FrameError, InternKey};
use crate::session::CaptureSession;
use loupe_common::CAPTURE_FILE_EXTENSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Metadata,
    Events,
}

/// Writes header, metadata and events in that order.
pub struct CaptureWriter<W: Write> {
    writer: W,
    phase: Phase,
    bytes_written: u64,
    events_written: u64,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, phase: Phase::Header, bytes_written: 0, events_written: 0 }
    }

    /// # Errors
    /// Returns an error if the header was already written or the write fails
    pub fn write_header(&mut self) -> Result<(), FrameError> {
        self.expect(Phase::Header, "header")?;
        self.bytes_written += write_message(&mut self.writer, &CaptureHeader::current())? as u64;
        self.phase = Phase::Metadata;
        Ok(())
    }

    /// # Errors
    /// Returns an error if called out of order or the write fails
    pub fn write_metadata(&mut self, info: &CaptureInfo) -> Result<(), FrameError> {
        self.expect(Phase::Metadata, "capture info")?;
        self.bytes_written += write_message(&mut self.writer, info)? as u64;
        self.phase = Phase::Events;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the metadata was not written yet or the write fails
    pub fn write_event(&mut self, event: &CaptureEvent) -> Result<(), FrameError> {
        self.expect(Phase::Events, "events")?;
        self.bytes_written += write_message(&mut self.writer, event)? as u64;
        self.events_written += 1;
        Ok(())
    }

    fn expect(&self, phase: Phase, what: &'static str) -> Result<(), FrameError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(FrameError::OutOfOrder { expected: what })
        }
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    #[must_use]
    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    /// Flush and return the underlying writer.
    ///
    /// # Errors
    /// Returns an error if flushing fails
    pub fn finish(mut self) -> Result<W, FrameError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// `<process>_<YYYY_MM_DD_HH_MM_SS>.loupe`
#[must_use]
pub fn capture_file_name(process_name: &str, time: &DateTime<Local>) -> String {
    let stem = Path::new(process_name)
        .file_stem()
        .map_or_else(|| process_name.to_string(), |s| s.to_string_lossy().into_owned());
    format!("{stem}_{}.{CAPTURE_FILE_EXTENSION}", time.format("%Y_%m_%d_%H_%M_%S"))
}

/// Append `.loupe` unless `path` already ends with it.
#[must_use]
pub fn ensure_extension(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == CAPTURE_FILE_EXTENSION) {
        return path.to_path_buf();
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(CAPTURE_FILE_EXTENSION);
    PathBuf::from(name)
}

/// Write `session` to `path` (extension added if missing) and return the final path.
///
/// Interned payloads are written before the events that reference them.
///
/// # Errors
/// Returns an error if the session never started, or the file cannot be written
pub fn save_capture(session: &CaptureSession, path: &Path) -> Result<PathBuf, FrameError> {
    let info = session.capture_info().ok_or(FrameError::OutOfOrder { expected: "capture info" })?;
    let path = ensure_extension(path);
    let mut writer = CaptureWriter::new(BufWriter::new(File::create(&path)?));

    writer.write_header()?;
    writer.write_metadata(&info)?;
    for event in session_events(session) {
        writer.write_event(&event)?;
    }

    let (events, bytes) = (writer.events_written(), writer.bytes_written());
    writer.finish()?;
    info!("Saved {events} events ({bytes} bytes) to \"{}\"", path.display());
    Ok(path)
}

fn session_events(session: &CaptureSession) -> impl Iterator<Item = CaptureEvent> + '_ {
    let thread_names = session
        .thread_names()
        .map(|(tid, name)| CaptureEvent::ThreadName { tid, name: name.to_string() });
    let callstacks = session.callstacks().snapshot().into_iter().map(|(key, stack)| {
        let callstack: CallStack = (*stack).clone();
        CaptureEvent::UniqueCallStack { key, callstack }
    });
    let tracepoints = session.tracepoints().snapshot().into_iter().map(|(key, info)| {
        CaptureEvent::UniqueTracepointInfo { key, info: (*info).clone() }
    });
    let strings = session.strings().snapshot().into_iter().map(|(InternKey(key), value)| {
        CaptureEvent::KeyAndString { key, value: (*value).clone() }
    });
    let address_infos = session.address_infos().cloned().map(CaptureEvent::AddressInfo);
    let slices = session.thread_state_slices().cloned().map(CaptureEvent::ThreadStateSlice);
    let samples = session.callstack_events().iter().cloned().map(CaptureEvent::CallstackEvent);
    let tracepoint_events =
        session.tracepoint_events().iter().cloned().map(CaptureEvent::TracepointEvent);
    let timers = session.timers().chains().flat_map(|(_, chain)| chain.iter().cloned());

    thread_names
        .chain(callstacks)
        .chain(tracepoints)
        .chain(strings)
        .chain(address_infos)
        .chain(slices)
        .chain(samples)
        .chain(tracepoint_events)
        .chain(timers.map(CaptureEvent::Timer))
}
