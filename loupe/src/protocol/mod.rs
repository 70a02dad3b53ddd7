//! # Capture Session Protocol
//!
//! The persisted capture format and the loader that replays it into a
//! [`CaptureListener`](crate::listener::CaptureListener).
//!
//! ## File Layout
//!
//! ```text
//! [header,   length-prefixed]   CaptureHeader { version }
//! [metadata, length-prefixed]   CaptureInfo { process, modules, selected functions, tracepoints }
//! [event,    length-prefixed]*  CaptureEvent, repeated until end of file
//! ```
//!
//! Exactly one format version
//! ([`CAPTURE_FORMAT_VERSION`](loupe_common::CAPTURE_FORMAT_VERSION)) is accepted.
//! A file declaring any other version is rejected before anything else is decoded.
//!
//! ## Error Boundary
//!
//! Decode functions return `Result`s; the loader is the only place that turns a
//! failure into the single `on_capture_failed` callback.

pub mod cancellation;
pub mod framing;
pub mod loader;
pub mod messages;
pub mod writer;

pub use cancellation::CancellationToken;
pub use framing::{read_message, write_message};
pub use loader::{load_capture, load_from_reader, spawn_load, LoadState};
pub use messages::{CaptureEvent, CaptureHeader, CaptureInfo};
pub use writer::{capture_file_name, ensure_extension, save_capture, CaptureWriter};
