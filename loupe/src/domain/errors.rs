//! Structured error types for loupe
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Decode failures never escape the protocol layer as errors: the loader turns
//! them into a single `on_capture_failed` listener call.

use super::types::{InternKey, Pid, SessionId};
use thiserror::Error;

/// Failures while reading or writing one length-prefixed message.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Declared message length {0} exceeds the maximum of {1} bytes")]
    TooLarge(usize, usize),

    #[error("Failed to decode message payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Failed to encode message payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Message payload has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("Capture messages written out of order: expected {expected}")]
    OutOfOrder { expected: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the header and metadata phases of a capture load.
#[derive(Error, Debug)]
pub enum CaptureLoadError {
    #[error("Error opening file \"{file}\" for reading")]
    Open { file: String },

    #[error(
        "Error parsing the capture from \"{file}\".\nNote: If the capture was taken with a \
         previous loupe version, it could be incompatible. Please check release notes for \
         more information."
    )]
    Malformed { file: String },

    #[error(
        "Unsupported capture format version in \"{file}\": file has version {found}, \
         this build only supports version {supported}"
    )]
    UnsupportedVersion { file: String, found: String, supported: String },
}

/// Failures growing the event block store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Out of memory allocating an event block of {0} events")]
    OutOfMemory(usize),
}

/// Failures publishing an externally keyed value into an interning table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternError {
    #[error("Key {0} is already bound to different content")]
    KeyConflict(InternKey),
}

/// Failures reading the address space of a live process.
#[derive(Error, Debug)]
pub enum AddressSpaceError {
    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("Failed to read /proc/{0}/maps")]
    MemoryMapsParseFailed(Pid),

    #[error("Module \"{path}\" rejected: {reason}")]
    InvalidModule { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the symbol and line-information collaborators.
#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("Failed to read object file \"{path}\": {source}")]
    Read { path: String, source: std::io::Error },

    #[error("Failed to parse object file \"{path}\": {reason}")]
    Parse { path: String, reason: String },

    #[error("Unable to load symbols from \"{0}\", not even a single function symbol found")]
    NoSymbols(String),

    #[error("No debug information in \"{0}\"")]
    NoDebugInfo(String),

    #[error("Unable to get line info for address 0x{address:x} in \"{path}\"")]
    NoLineInfo { path: String, address: u64 },
}

/// Failures of the agent transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to the capture agent lost")]
    Disconnected,
}

/// Failures of live capture orchestration.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No process selected. Please choose a target process for the capture.")]
    NoTargetProcess,

    #[error("A capture is already in progress ({0})")]
    AlreadyRecording(SessionId),

    #[error("{0} producers of the previous session are still writing")]
    ProducersActive(usize),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_version_names_both_versions() {
        let err = CaptureLoadError::UnsupportedVersion {
            file: "old.loupe".to_string(),
            found: "1.52".to_string(),
            supported: "1.59".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("old.loupe"));
        assert!(msg.contains("1.52"));
        assert!(msg.contains("1.59"));
    }

    #[test]
    fn test_malformed_mentions_file_and_hint() {
        let err = CaptureLoadError::Malformed { file: "broken.loupe".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("broken.loupe"));
        assert!(msg.contains("incompatible"));
    }

    #[test]
    fn test_no_target_error_display() {
        assert!(SessionError::NoTargetProcess.to_string().starts_with("No process selected"));
    }
}
