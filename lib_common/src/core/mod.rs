//! # Core Engine Module
//!
//! The relay's runtime: one upstream socket in, many subscriber streams out.
//!
//! ## Core Components:
//!
//! - **`registry`**: per-station state (label, last seen, connection status,
//!   pressure history). Owned and written only by the connection manager.
//!
//! - **`bus`**: typed publish/subscribe with zero-copy `Arc` fan-out and
//!   synchronous unsubscribe.
//!
//! - **`upstream_manager`**: the connection manager. Opens and keeps alive the
//!   upstream WebSocket, runs device discovery, subscribes devices, normalizes
//!   frames and publishes everything on the bus.
//!
//! - **`subscriber`**: adapts bus callbacks into a per-subscriber queue and
//!   stream, replaying the current snapshot before live events.
//!
//! Publishing happens while the registry lock is held, and attaching takes
//! the same lock, so a new subscriber sees either the snapshot or the live
//! event for any transition, never neither.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Typed publish/subscribe bus.
pub mod bus;
/// Per-station state.
pub mod registry;
/// Per-subscriber queue and stream adapter.
pub mod subscriber;
/// The upstream connection manager.
pub mod upstream_manager;

// --- Public API Re-exports ---
pub use bus::{Bus, BusMessage, Subscription, Topic};
pub use registry::{Station, StationRegistry};
pub use subscriber::{Attachment, DownstreamFrame};
pub use upstream_manager::{ConnectionManager, SocketState, UpstreamConfig, UpstreamConnectionState};
