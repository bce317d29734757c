//! Logging setup and in-process counters for wake detection.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Errors raised while installing telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("subscriber setup failed: {0}")]
    Subscriber(String),
}

/// Initialize structured logging (JSON on stderr) with env filter, ignoring
/// a subscriber that is already installed.
/// Set RUST_LOG, e.g., "info,detector=debug".
pub fn init_json_logging() {
    try_init_json_logging().ok();
}

/// Like [`init_json_logging`] but reports when a global subscriber already exists.
pub fn try_init_json_logging() -> Result<(), TelemetryError> {
    let fmt_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_current_span(true)
        .with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Counters shared by a detector's legs and merge stage. Cloning shares the
/// underlying counters.
#[derive(Clone, Debug, Default)]
pub struct DetectorMetrics {
    raw_reports: Arc<AtomicU64>,
    paired_events: Arc<AtomicU64>,
    single_leg_events: Arc<AtomicU64>,
}

/// Point-in-time copy of [`DetectorMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Drift reports published by legs.
    pub raw_reports: u64,
    /// Events emitted as the mean of two leg reports.
    pub paired_events: u64,
    /// Events emitted from a single leg report after the pairing timer fired.
    pub single_leg_events: u64,
}

impl MetricsSnapshot {
    /// Total events emitted, paired or not.
    pub const fn events(&self) -> u64 {
        self.paired_events + self.single_leg_events
    }
}

impl DetectorMetrics {
    /// Fresh counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }
    /// A leg published a drift report.
    pub fn record_raw_report(&self) {
        let _ = self.raw_reports.fetch_add(1, Ordering::Relaxed);
    }
    /// The merge stage emitted the mean of two reports.
    pub fn record_paired_event(&self) {
        let _ = self.paired_events.fetch_add(1, Ordering::Relaxed);
    }
    /// The merge stage emitted a lone report after its timer fired.
    pub fn record_single_leg_event(&self) {
        let _ = self.single_leg_events.fetch_add(1, Ordering::Relaxed);
    }
    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            raw_reports: self.raw_reports.load(Ordering::Relaxed),
            paired_events: self.paired_events.load(Ordering::Relaxed),
            single_leg_events: self.single_leg_events.load(Ordering::Relaxed),
        }
    }
}
