//! Prometheus metrics for the automaton.
//!
//! # Metrics
//!
//! ## Counters
//! - `hydra_mutations_applied_total` - Applied mutations by mutation type
//!
//! ## Histograms
//! - `hydra_batch_commit_seconds` - Duration of commit drains
//! - `hydra_snapshot_build_seconds` - Duration of snapshot builds
//! - `hydra_snapshot_load_seconds` - Duration of snapshot loads
//!
//! ## Gauges
//! - `hydra_logged_record_id` - Record id of the logged version
//! - `hydra_automaton_record_id` - Record id of the automaton version
//! - `hydra_pending_mutations` - Mutations logged but not yet committed

use hydra_core::Version;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

/// Buckets for commit drains (in seconds).
const COMMIT_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Buckets for snapshot builds and loads (in seconds).
const SNAPSHOT_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Automaton metrics with their own registry.
pub struct AutomatonMetrics {
    registry: Registry,

    /// Applied mutations by type.
    pub mutations_applied: IntCounterVec,
    /// Commit drain duration.
    pub batch_commit: Histogram,
    /// Snapshot build duration.
    pub snapshot_build: Histogram,
    /// Snapshot load duration.
    pub snapshot_load: Histogram,
    /// Record id of the logged version.
    pub logged_record_id: IntGauge,
    /// Record id of the automaton version.
    pub automaton_record_id: IntGauge,
    /// Pending mutation queue length.
    pub pending_mutations: IntGauge,
}

impl AutomatonMetrics {
    /// Create the metrics and register them.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let mutations_applied = IntCounterVec::new(
            Opts::new("hydra_mutations_applied_total", "Total applied mutations"),
            &["mutation_type"],
        )?;
        let batch_commit = Histogram::with_opts(
            HistogramOpts::new("hydra_batch_commit_seconds", "Commit drain duration")
                .buckets(COMMIT_BUCKETS.to_vec()),
        )?;
        let snapshot_build = Histogram::with_opts(
            HistogramOpts::new("hydra_snapshot_build_seconds", "Snapshot build duration")
                .buckets(SNAPSHOT_BUCKETS.to_vec()),
        )?;
        let snapshot_load = Histogram::with_opts(
            HistogramOpts::new("hydra_snapshot_load_seconds", "Snapshot load duration")
                .buckets(SNAPSHOT_BUCKETS.to_vec()),
        )?;
        let logged_record_id = IntGauge::with_opts(Opts::new(
            "hydra_logged_record_id",
            "Record id of the logged version",
        ))?;
        let automaton_record_id = IntGauge::with_opts(Opts::new(
            "hydra_automaton_record_id",
            "Record id of the automaton version",
        ))?;
        let pending_mutations = IntGauge::with_opts(Opts::new(
            "hydra_pending_mutations",
            "Mutations logged but not yet committed",
        ))?;

        registry.register(Box::new(mutations_applied.clone()))?;
        registry.register(Box::new(batch_commit.clone()))?;
        registry.register(Box::new(snapshot_build.clone()))?;
        registry.register(Box::new(snapshot_load.clone()))?;
        registry.register(Box::new(logged_record_id.clone()))?;
        registry.register(Box::new(automaton_record_id.clone()))?;
        registry.register(Box::new(pending_mutations.clone()))?;

        Ok(Self {
            registry,
            mutations_applied,
            batch_commit,
            snapshot_build,
            snapshot_load,
            logged_record_id,
            automaton_record_id,
            pending_mutations,
        })
    }

    /// Record one applied mutation.
    pub fn record_applied(&self, mutation_type: &str) {
        self.mutations_applied
            .with_label_values(&[mutation_type])
            .inc();
    }

    /// Update the version gauges.
    pub fn set_versions(&self, logged: Version, automaton: Version) {
        self.logged_record_id.set(gauge_value(logged.record_id));
        self.automaton_record_id.set(gauge_value(automaton.record_id));
    }

    /// Update the pending queue gauge.
    pub fn set_pending(&self, count: usize) {
        self.pending_mutations.set(gauge_value(count as u64));
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format.
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_creation() {
        let metrics = AutomatonMetrics::new().unwrap();
        metrics.record_applied("Put");
        let output = metrics.gather().unwrap();
        assert!(output.contains("hydra_mutations_applied_total"));
        assert!(output.contains("mutation_type=\"Put\""));
    }

    #[test]
    fn version_gauges() {
        let metrics = AutomatonMetrics::new().unwrap();
        metrics.set_versions(Version::new(2, 7), Version::new(2, 5));
        metrics.set_pending(2);
        assert_eq!(metrics.logged_record_id.get(), 7);
        assert_eq!(metrics.automaton_record_id.get(), 5);
        assert_eq!(metrics.pending_mutations.get(), 2);
    }

    #[test]
    fn registries_are_independent() {
        let a = AutomatonMetrics::new().unwrap();
        let b = AutomatonMetrics::new().unwrap();
        a.record_applied("Put");
        assert!(!b.gather().unwrap().contains("mutation_type=\"Put\""));
    }
}
