//! # Weather Telemetry Module
//!
//! Everything that understands the upstream weather-station feed lives here.
//! The rest of the crate only sees the canonical records defined in `model`.
//!
//! ## Contained Modules:
//!
//! - **`model`**: The canonical `Observation`, `WeatherEvent` and
//!   `StatusEvent` records that flow over the bus and out to subscribers.
//! - **`normalizer`**: Turns one upstream JSON frame into zero or one
//!   canonical record. Never fails across its boundary.
//! - **`metrics`**: Derived values: humidex-style feels-like temperature and
//!   the barometric trend over a bounded pressure history.
//! - **`discovery`**: REST prefetch of the devices reachable with a token.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Canonical telemetry records.
pub mod model;
/// Upstream frame parsing and normalization.
pub mod normalizer;
/// Feels-like temperature and barometric trend.
pub mod metrics;
/// Device discovery over the upstream REST API.
pub mod discovery;

pub use model::{BarometricTrend, ConnectionStatus, EventKind, Observation, StatusEvent, WeatherEvent};
pub use normalizer::{normalize, Normalized};
