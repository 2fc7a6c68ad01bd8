//! Metrics for tablet bootstrap and log replay.

mod collector;

pub use collector::{Counter, Gauge};

use std::sync::Arc;

/// Metric context handed to bootstrap and the log it opens.
///
/// Cheap to clone; all clones share the same underlying counters.
#[derive(Debug, Clone, Default)]
pub struct MetricContext {
    inner: Arc<BootstrapMetrics>,
}

impl MetricContext {
    /// Create a fresh metric context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bootstrap metrics group.
    pub fn bootstrap(&self) -> &BootstrapMetrics {
        &self.inner
    }
}

/// Counters observed during a tablet bootstrap.
#[derive(Debug, Default)]
pub struct BootstrapMetrics {
    /// Log segments fully replayed.
    pub segments_replayed: Counter,
    /// Log entries handled (replicates and commits).
    pub entries_replayed: Counter,
    /// Row operations re-applied to the tablet.
    pub ops_applied: Counter,
    /// Row operations skipped because their effects were already durable.
    pub ops_already_flushed: Counter,
    /// Replicates left unmatched at end of replay.
    pub orphaned_replicates: Gauge,
}
