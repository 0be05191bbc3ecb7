//! Tracing setup for the connector.
//!
//! Structured logs go through `tracing` with `RUST_LOG`-style filtering.
//! Exporting to external telemetry systems is a deployment concern and lives
//! outside this crate; everything here stays local to the process.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Builder for the process-wide tracing subscriber.
///
/// ```ignore
/// let _telemetry = Telemetry::new()
///     .with_name(env!("CARGO_PKG_NAME"))
///     .with_version(env!("CARGO_PKG_VERSION"))
///     .register();
/// ```
#[derive(Debug, Default)]
pub struct Telemetry {
    name: Option<&'static str>,
    version: Option<&'static str>,
}

/// Keeps the subscriber registration alive for the process lifetime.
pub struct TelemetryGuard {
    _private: (),
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = Some(version);
        self
    }

    /// Install the subscriber globally. Defaults to `info` when `RUST_LOG`
    /// is unset.
    pub fn register(self) -> TelemetryGuard {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
        if let (Some(name), Some(version)) = (self.name, self.version) {
            tracing::info!(service = name, version, "telemetry initialized");
        }
        TelemetryGuard { _private: () }
    }
}
