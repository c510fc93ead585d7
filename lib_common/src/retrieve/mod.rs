//! # Data Retrieval Module
//!
//! Generic HTTP retrieval used by the rest of the crate. Device discovery goes
//! through here so that request building, retries and response handling live
//! in one place instead of being repeated per upstream endpoint.
//!
//! ## Contained Modules:
//!
//! - **`rest_client`**: A `RestClient` built on `reqwest` and
//!   `reqwest-middleware`, featuring automatic retries with exponential
//!   backoff and a non-throwing response envelope for non-2xx statuses.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP client with retry middleware for resilient network requests.
pub mod rest_client;
