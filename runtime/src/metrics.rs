//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for every engine component:
//! - Event processing (outcome per event type, latency)
//! - Log acknowledgement and idle-entry reclaim
//! - Prune cycles
//! - Window gauges, published by the pruner through [`PrometheusGaugeSink`]
//!
//! # Example
//!
//! ```rust,no_run
//! use pulse_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 8001
//! let mut server = MetricsServer::new("0.0.0.0:8001".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:8001/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use pulse_core::gauge::{GaugeSink, WindowGauges};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and exposes `/metrics` over HTTP for
/// Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:8001`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// succeeds without starting a second listener and [`Self::handle`] stays
    /// `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        // Register all metric descriptions
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let addr = self.addr;
                tokio::spawn(async move {
                    // ExporterError carries no Debug or Display impl
                    if exporter.await.is_err() {
                        tracing::error!(addr = %addr, "Metrics listener stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(_) => {
                // In tests, multiple MetricsServer instances may be created
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// The address the listener binds to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Processing Metrics
    describe_counter!(
        "events_processed_total",
        "Total number of events processed, labelled by status and event type"
    );
    describe_counter!(
        "processing_errors_total",
        "Total number of events whose aggregate updates failed"
    );
    describe_histogram!(
        "event_processing_duration_seconds",
        "Time taken to apply one event to the aggregates"
    );

    // Log Metrics
    describe_counter!(
        "events_acknowledged_total",
        "Total number of log entries acknowledged"
    );
    describe_counter!(
        "events_reclaimed_total",
        "Total number of idle pending entries reclaimed from other consumers"
    );

    // Pruner Metrics
    describe_counter!("prune_cycles_total", "Total number of completed prune cycles");
    describe_counter!("prune_errors_total", "Total number of failed prune cycles");

    // Window Gauges
    describe_gauge!("active_users", "Users seen within the active-user window");
    describe_gauge!("active_sessions", "Sessions seen within the session window");
}

/// Event processing metrics recorder.
pub struct ProcessingMetrics;

impl ProcessingMetrics {
    /// Record a successfully processed event.
    pub fn record_success(event_type: &str, duration: Duration) {
        counter!(
            "events_processed_total",
            "status" => "success",
            "event_type" => event_type.to_owned()
        )
        .increment(1);
        histogram!("event_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an event whose aggregate updates failed.
    pub fn record_error(event_type: &str) {
        counter!(
            "events_processed_total",
            "status" => "error",
            "event_type" => event_type.to_owned()
        )
        .increment(1);
        counter!("processing_errors_total").increment(1);
    }
}

/// Log consumption metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record an acknowledged entry.
    pub fn record_ack() {
        counter!("events_acknowledged_total").increment(1);
    }

    /// Record entries reclaimed from idle consumers.
    pub fn record_reclaimed(count: usize) {
        counter!("events_reclaimed_total").increment(count as u64);
    }
}

/// Pruner metrics recorder.
pub struct PrunerMetrics;

impl PrunerMetrics {
    /// Record a completed prune cycle.
    pub fn record_cycle() {
        counter!("prune_cycles_total").increment(1);
    }

    /// Record a failed prune cycle.
    pub fn record_error() {
        counter!("prune_errors_total").increment(1);
    }
}

/// [`GaugeSink`] that sets the `active_users` and `active_sessions`
/// Prometheus gauges.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusGaugeSink;

impl GaugeSink for PrometheusGaugeSink {
    #[allow(clippy::cast_precision_loss)] // Gauge values are far below 2^52
    fn publish(&self, gauges: WindowGauges) {
        gauge!("active_users").set(gauges.active_users as f64);
        gauge!("active_sessions").set(gauges.active_sessions as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert_eq!(server.addr(), addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        ProcessingMetrics::record_success("page_view", Duration::from_millis(2));
        ProcessingMetrics::record_error("click");
        ConsumerMetrics::record_ack();
        PrunerMetrics::record_cycle();
        PrometheusGaugeSink.publish(WindowGauges {
            active_users: 3,
            active_sessions: 4,
        });

        // If this test runs after another test initialized the recorder,
        // handle might be None. That's OK - metrics are still being recorded.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("events_processed_total"));
            assert!(rendered.contains("processing_errors_total"));
            assert!(rendered.contains("events_acknowledged_total"));
            assert!(rendered.contains("active_users 3"));
        }
    }
}
