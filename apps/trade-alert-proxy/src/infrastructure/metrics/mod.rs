//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Upstream**: frames and trades received, worker exits, reconnects
//! - **Alerts**: alerts queued, dropped and delivered
//! - **State**: active workers and directory entries
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the existing handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "trade_alerts_frames_received_total",
        "Total frames received from upstream feeds"
    );
    describe_counter!(
        "trade_alerts_trades_total",
        "Total trade events decoded from upstream feeds"
    );
    describe_counter!(
        "trade_alerts_malformed_frames_total",
        "Total upstream frames that could not be decoded"
    );
    describe_counter!(
        "trade_alerts_alerts_queued_total",
        "Total alerts handed to the delivery queue"
    );
    describe_counter!(
        "trade_alerts_alerts_dropped_total",
        "Total alerts dropped before delivery"
    );
    describe_counter!(
        "trade_alerts_deliveries_total",
        "Total delivery attempts by outcome"
    );
    describe_counter!(
        "trade_alerts_worker_starts_total",
        "Total feed workers started"
    );
    describe_counter!(
        "trade_alerts_worker_exits_total",
        "Total feed worker exits by reason"
    );
    describe_counter!(
        "trade_alerts_reconnects_total",
        "Total upstream reconnection attempts"
    );

    describe_gauge!(
        "trade_alerts_active_workers",
        "Number of feed workers with an open upstream connection"
    );
    describe_gauge!(
        "trade_alerts_directory_entries",
        "Number of (feed, subscriber) entries in the directory"
    );

    describe_histogram!(
        "trade_alerts_frame_processing_seconds",
        "Time to decode one frame and queue its alerts"
    );
    describe_histogram!(
        "trade_alerts_delivery_seconds",
        "Time to deliver one alert through the notification gateway"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Gateway accepted the alert.
    Delivered,
    /// Gateway returned an error.
    Failed,
    /// Gateway did not answer in time.
    TimedOut,
}

impl DeliveryOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Reason label for a worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stopped by the stream manager.
    Cancelled,
    /// Upstream fault ended the stream.
    Fault,
}

impl ExitReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Fault => "fault",
        }
    }
}

/// Record an inbound upstream frame.
pub fn record_frame_received() {
    counter!("trade_alerts_frames_received_total").increment(1);
}

/// Record a decoded trade.
pub fn record_trade() {
    counter!("trade_alerts_trades_total").increment(1);
}

/// Record a frame that could not be decoded.
pub fn record_malformed_frame() {
    counter!("trade_alerts_malformed_frames_total").increment(1);
}

/// Record how long one frame took to process.
pub fn record_frame_processing(duration: Duration) {
    histogram!("trade_alerts_frame_processing_seconds").record(duration.as_secs_f64());
}

/// Record alerts handed to the delivery queue.
pub fn record_alerts_queued(count: u64) {
    counter!("trade_alerts_alerts_queued_total").increment(count);
}

/// Record an alert dropped before delivery.
pub fn record_alert_dropped(reason: &'static str) {
    counter!("trade_alerts_alerts_dropped_total", "reason" => reason).increment(1);
}

/// Record one delivery attempt and its duration.
pub fn record_delivery(outcome: DeliveryOutcome, duration: Duration) {
    counter!("trade_alerts_deliveries_total", "outcome" => outcome.as_str()).increment(1);
    histogram!("trade_alerts_delivery_seconds").record(duration.as_secs_f64());
}

/// Record a worker start.
pub fn record_worker_started() {
    counter!("trade_alerts_worker_starts_total").increment(1);
}

/// Record a worker exit.
pub fn record_worker_exit(reason: ExitReason) {
    counter!("trade_alerts_worker_exits_total", "reason" => reason.as_str()).increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("trade_alerts_reconnects_total").increment(1);
}

/// Update the active worker count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_workers(count: usize) {
    gauge!("trade_alerts_active_workers").set(count as f64);
}

/// Update the directory entry count.
#[allow(clippy::cast_precision_loss)]
pub fn set_directory_entries(count: usize) {
    gauge!("trade_alerts_directory_entries").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
