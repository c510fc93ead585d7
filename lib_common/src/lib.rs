//! # lib_common
//!
//! Shared library for the weather telemetry relay. Each top-level folder is a
//! feature-gated module so binaries only compile what they use.
//!
//! - `weather`: canonical records, upstream frame normalization, derived
//!   metrics and device discovery.
//! - `core`: station registry, bus, upstream connection manager and the
//!   subscriber adapter.
//! - `client`: push-stream decoding and the client health monitor.
//! - `retrieve`: REST client with retries.

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "weather")]
pub mod weather;
