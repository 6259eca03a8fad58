//! Generation metrics
//!
//! # Metrics
//!
//! - `generation_started_total`: Counter of generations started
//! - `generation_outcomes_total`: Counter of finished generations by outcome
//! - `generation_active`: Gauge of generations currently running
//! - `generation_duration_seconds`: Histogram of generation duration by outcome
//! - `chunks_appended_total`: Counter of chunks persisted
//! - `finalizations_total`: Counter of finalization attempts by result
//! - `recovery_finalized_total`: Counter of messages finalized by recovery sweeps
//!
//! # Examples
//!
//! ```
//! use threadline::generation::metrics::GenerationMetrics;
//!
//! let metrics = GenerationMetrics::start("scripted");
//! metrics.record_outcome("completed");
//! ```

use metrics::{counter, decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Metrics for one running generation
///
/// Increments the active gauge on creation and decrements it exactly once,
/// either when an outcome is recorded or on drop.
#[derive(Debug)]
pub struct GenerationMetrics {
    provider: String,
    start: Instant,
    recorded: AtomicBool,
}

impl GenerationMetrics {
    /// Starts tracking a generation driven by `provider`
    pub fn start(provider: &str) -> Self {
        increment_counter!("generation_started_total", "provider" => provider.to_string());
        increment_gauge!("generation_active", 1.0);

        Self {
            provider: provider.to_string(),
            start: Instant::now(),
            recorded: AtomicBool::new(false),
        }
    }

    /// Records how the generation ended; later calls are ignored
    pub fn record_outcome(&self, outcome: &str) {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return;
        }

        histogram!(
            "generation_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "provider" => self.provider.clone(),
            "outcome" => outcome.to_string()
        );
        increment_counter!(
            "generation_outcomes_total",
            "provider" => self.provider.clone(),
            "outcome" => outcome.to_string()
        );
        decrement_gauge!("generation_active", 1.0);
    }

    /// Whether an outcome has been recorded
    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }

    /// Time since the generation started
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for GenerationMetrics {
    fn drop(&mut self) {
        if !self.recorded.load(Ordering::SeqCst) {
            decrement_gauge!("generation_active", 1.0);
        }
    }
}

/// Counts one persisted chunk
pub fn record_chunk_appended() {
    increment_counter!("chunks_appended_total");
}

/// Counts a finalization attempt (`finalized`, `already_final` or `failed`)
pub fn record_finalization(result: &'static str) {
    increment_counter!("finalizations_total", "result" => result);
}

/// Counts messages finalized by a recovery sweep
pub fn record_recovered(count: usize) {
    if count > 0 {
        counter!("recovery_finalized_total", count as u64);
    }
}

/// Installs the Prometheus exporter when built with the `prometheus` feature
///
/// Without the feature, or without an address, this does nothing.
pub fn init_metrics_exporter(address: Option<&str>) {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let Some(address) = address else {
            return;
        };
        let addr: std::net::SocketAddr = match address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Invalid metrics address {}: {}", address, e);
                return;
            }
        };
        match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => tracing::info!("Prometheus exporter listening on {}", addr),
            Err(e) => tracing::warn!("Failed to install Prometheus exporter: {}", e),
        }
    }

    #[cfg(not(feature = "prometheus"))]
    if let Some(address) = address {
        tracing::debug!(
            "Metrics address {} ignored: built without the prometheus feature",
            address
        );
    }
}
