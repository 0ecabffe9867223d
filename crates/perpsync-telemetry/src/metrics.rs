//! Prometheus metrics for the perpsync engine.
//!
//! Covers the cost the engine exists to minimise (remote reads) and the
//! signals that explain it:
//! - Cache lookups by freshness
//! - Coalesced fetches (started vs joined)
//! - Remote attempts, retries and exhaustion
//! - Scope phases and refresh latency
//! - Forwarded writes
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a programming error caught at first use.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

/// Cache lookups.
/// Labels: resource, outcome (fresh/stale/miss)
pub static CACHE_LOOKUPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpsync_cache_lookups_total",
        "Cache lookups by freshness outcome",
        &["resource", "outcome"]
    )
    .unwrap()
});

/// Cache writes rejected because a newer value was already cached.
pub static CACHE_STALE_WRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpsync_cache_stale_writes_total",
        "Cache writes rejected by the fetch-start timestamp guard",
        &["resource"]
    )
    .unwrap()
});

/// Coalesced fetches.
/// Labels: resource, role (started/joined)
pub static COALESCED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpsync_coalesced_total",
        "Fetches that started a remote call vs joined an in-flight one",
        &["resource", "role"]
    )
    .unwrap()
});

/// Remote read attempts.
/// Labels: operation, outcome (ok/transient/timeout/decode/...)
pub static REMOTE_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpsync_remote_attempts_total",
        "Remote read attempts by outcome",
        &["operation", "outcome"]
    )
    .unwrap()
});

/// Retry envelopes that ran out of attempts.
pub static RETRY_EXHAUSTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpsync_retry_exhausted_total",
        "Retry envelopes that exhausted max attempts",
        &["operation"]
    )
    .unwrap()
});

/// Records skipped because they failed to decode.
pub static DECODE_SKIPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpsync_decode_skipped_total",
        "Remote records skipped due to decode errors",
        &["resource"]
    )
    .unwrap()
});

/// Scope phase (1 = active).
/// Labels: resource, phase
pub static SCOPE_PHASE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "perpsync_scope_phase",
        "Number of scopes currently in each phase",
        &["resource", "phase"]
    )
    .unwrap()
});

/// Refresh cycle latency in milliseconds.
pub static REFRESH_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "perpsync_refresh_duration_ms",
        "Refresh cycle duration in milliseconds",
        &["resource", "result"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0]
    )
    .unwrap()
});

/// Forwarded writes.
/// Labels: operation, outcome (confirmed/failed/rejected)
pub static WRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpsync_writes_total",
        "Forwarded write intents by terminal outcome",
        &["operation", "outcome"]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record a cache lookup.
    pub fn cache_lookup(resource: &str, outcome: &str) {
        CACHE_LOOKUPS_TOTAL
            .with_label_values(&[resource, outcome])
            .inc();
    }

    /// Record a rejected out-of-order cache write.
    pub fn cache_stale_write(resource: &str) {
        CACHE_STALE_WRITES_TOTAL.with_label_values(&[resource]).inc();
    }

    /// Record a fetch that started a new in-flight request.
    pub fn coalesce_started(resource: &str) {
        COALESCED_TOTAL
            .with_label_values(&[resource, "started"])
            .inc();
    }

    /// Record a fetch that joined an existing in-flight request.
    pub fn coalesce_joined(resource: &str) {
        COALESCED_TOTAL.with_label_values(&[resource, "joined"]).inc();
    }

    /// Record one remote attempt.
    pub fn remote_attempt(operation: &str, outcome: &str) {
        REMOTE_ATTEMPTS_TOTAL
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Record retry exhaustion.
    pub fn retry_exhausted(operation: &str) {
        RETRY_EXHAUSTED_TOTAL.with_label_values(&[operation]).inc();
    }

    /// Record a skipped record.
    pub fn decode_skipped(resource: &str) {
        DECODE_SKIPPED_TOTAL.with_label_values(&[resource]).inc();
    }

    /// Move one scope from `from` to `to`.
    pub fn scope_transition(resource: &str, from: Option<&str>, to: Option<&str>) {
        if let Some(from) = from {
            SCOPE_PHASE.with_label_values(&[resource, from]).dec();
        }
        if let Some(to) = to {
            SCOPE_PHASE.with_label_values(&[resource, to]).inc();
        }
    }

    /// Record refresh cycle latency.
    pub fn refresh_duration(resource: &str, ok: bool, duration_ms: f64) {
        let result = if ok { "ok" } else { "error" };
        REFRESH_DURATION_MS
            .with_label_values(&[resource, result])
            .observe(duration_ms);
    }

    /// Record a forwarded write outcome.
    pub fn write_outcome(operation: &str, outcome: &str) {
        WRITES_TOTAL.with_label_values(&[operation, outcome]).inc();
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn gather() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_recorded_metrics() {
        Metrics::cache_lookup("positions", "fresh");
        Metrics::coalesce_joined("positions");
        let text = Metrics::gather().unwrap();
        assert!(text.contains("perpsync_cache_lookups_total"));
        assert!(text.contains("perpsync_coalesced_total"));
    }

    #[test]
    fn test_scope_transition_moves_gauge() {
        Metrics::scope_transition("orders", None, Some("ready"));
        Metrics::scope_transition("orders", Some("ready"), Some("refreshing"));
        let ready = SCOPE_PHASE.with_label_values(&["orders", "ready"]).get();
        let refreshing = SCOPE_PHASE.with_label_values(&["orders", "refreshing"]).get();
        assert_eq!(ready, 0.0);
        assert_eq!(refreshing, 1.0);
    }
}
