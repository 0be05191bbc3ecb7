//! Utility types shared across the connector:
//!
//! - [`sig_down`] - graceful shutdown signal handling
//! - [`telemetry`] - tracing setup

pub mod sig_down;
pub mod telemetry;

pub use sig_down::*;
pub use telemetry::*;
