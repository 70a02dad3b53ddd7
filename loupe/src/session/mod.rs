//! # Capture Sessions
//!
//! - [`CaptureSession`]: in-memory model of one capture, fed through the
//!   [`CaptureListener`](crate::listener::CaptureListener) contract by either the file
//!   loader or the live controller
//! - [`CaptureController`]: start/stop orchestration against a live agent
//! - [`AgentTransport`]: the message channel to that agent
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start_capture──▶ Recording ──stop_capture──▶ Idle
//!                            │                         │
//!                            └──── agent events ───────┴──▶ pump() ──▶ CaptureSession
//! ```
//!
//! Every `start_capture` builds a new session with its own interning tables and event
//! store. Agent messages tagged with an older session id are dropped.

pub mod capture_session;
pub mod controller;
pub mod transport;

pub use capture_session::{CaptureSession, CaptureSummary, Producer, SessionOutcome};
pub use controller::{CaptureController, ControllerState, PumpStatus};
pub use transport::{AgentEndpoint, AgentTransport, ChannelTransport, DispatchFn};
