//! # Client Module
//!
//! The subscriber side of the push stream: what a downstream session runs to
//! keep its own view of every station fresh.
//!
//! ## Contained Modules:
//!
//! - **`sse`**: An incremental Server-Sent-Events decoder that tolerates
//!   arbitrary chunk boundaries.
//! - **`health`**: The Client Health Monitor, a timer-free state machine that
//!   merges station data, aggregates configuration errors and decides when
//!   the session should re-attach.
//! - **`session`**: The async driver that attaches to a stream, feeds the
//!   monitor and owns the sweep, grace and reconnect timers.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Client Health Monitor state machine.
pub mod health;
/// Reconnecting push-stream session.
pub mod session;
/// Server-Sent-Events decoding.
pub mod sse;

pub use health::{HealthAction, HealthConfig, HealthMonitor, StationReport, StationView};
pub use session::ClientSession;
pub use sse::{SseDecoder, SseFrame};
