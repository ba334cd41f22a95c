//! Prometheus metrics for the ledger

use crate::error::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Ledger metrics, registered against a private registry
pub struct Metrics {
    registry: Registry,

    /// Transactions committed through the validation pipeline
    pub transactions_committed: IntCounter,
    /// Transactions rejected, labelled by reason code
    pub transactions_rejected: IntCounterVec,
    /// Commits aborted on a record version conflict
    pub concurrency_conflicts: IntCounter,
    /// Anchors recorded
    pub anchors_recorded: IntCounter,
    /// Journal entries rolled back by the sweeper
    pub sweeper_rollbacks: IntCounter,
    /// End-to-end post latency in seconds
    pub post_duration: Histogram,
}

impl Metrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let transactions_committed = IntCounter::with_opts(Opts::new(
            "ledger_transactions_committed_total",
            "Transactions committed",
        ))?;
        let transactions_rejected = IntCounterVec::new(
            Opts::new(
                "ledger_transactions_rejected_total",
                "Transactions rejected by reason code",
            ),
            &["reason"],
        )?;
        let concurrency_conflicts = IntCounter::with_opts(Opts::new(
            "ledger_concurrency_conflicts_total",
            "Commits aborted on a version conflict",
        ))?;
        let anchors_recorded = IntCounter::with_opts(Opts::new(
            "ledger_anchors_recorded_total",
            "Anchors recorded",
        ))?;
        let sweeper_rollbacks = IntCounter::with_opts(Opts::new(
            "ledger_sweeper_rollbacks_total",
            "Stale journal entries resolved by the sweeper",
        ))?;
        let post_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_post_duration_seconds",
                "End-to-end transaction post latency",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )?;

        registry.register(Box::new(transactions_committed.clone()))?;
        registry.register(Box::new(transactions_rejected.clone()))?;
        registry.register(Box::new(concurrency_conflicts.clone()))?;
        registry.register(Box::new(anchors_recorded.clone()))?;
        registry.register(Box::new(sweeper_rollbacks.clone()))?;
        registry.register(Box::new(post_duration.clone()))?;

        Ok(Self {
            registry,
            transactions_committed,
            transactions_rejected,
            concurrency_conflicts,
            anchors_recorded,
            sweeper_rollbacks,
            post_duration,
        })
    }

    /// The underlying registry, for embedding in an exporter
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}
