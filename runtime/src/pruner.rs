//! Periodic sweep of the global windows.
//!
//! Sharded keys (per-user session sets and page-view buckets) expire on
//! their own; the two global sorted sets do not, so the pruner deletes every
//! member whose last-seen score is at or below `now - window` and then
//! publishes the remaining cardinalities through a [`GaugeSink`].

use crate::metrics::PrunerMetrics;
use pulse_core::environment::Clock;
use pulse_core::gauge::{GaugeSink, WindowGauges};
use pulse_core::keys::KeyLayout;
use pulse_core::store::{AggregateStore, Pipeline, ScoreBound, StoreError};
use pulse_core::window::WindowConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors that can occur during a prune cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PruneError {
    /// The prune pipeline failed
    #[error("Prune failed: {0}")]
    Store(#[from] StoreError),

    /// A cardinality came back negative
    #[error("Invalid cardinality for '{set}': {value}")]
    InvalidCardinality {
        /// Sorted set key
        set: String,
        /// Reported value
        value: i64,
    },
}

/// Pruner settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrunerConfig {
    /// Time between prune cycles
    pub interval: Duration,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Removes expired members from the global windows.
pub struct Pruner {
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn GaugeSink>,
    keys: KeyLayout,
    windows: WindowConfig,
    config: PrunerConfig,
}

impl Pruner {
    /// Create a pruner with the default keys, windows and interval.
    #[must_use]
    pub fn new(
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn GaugeSink>,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            keys: KeyLayout::default(),
            windows: WindowConfig::default(),
            config: PrunerConfig::default(),
        }
    }

    /// Use a different key layout.
    #[must_use]
    pub fn with_keys(mut self, keys: KeyLayout) -> Self {
        self.keys = keys;
        self
    }

    /// Use different window lengths.
    #[must_use]
    pub const fn with_windows(mut self, windows: WindowConfig) -> Self {
        self.windows = windows;
        self
    }

    /// Use a different interval.
    #[must_use]
    pub const fn with_config(mut self, config: PrunerConfig) -> Self {
        self.config = config;
        self
    }

    /// The pipeline one cycle submits at `now` (epoch seconds).
    ///
    /// Replies: removed users, removed sessions, remaining users, remaining
    /// sessions.
    #[must_use]
    pub fn build_pipeline(&self, now: f64) -> Pipeline {
        Pipeline::new()
            .remove_range_by_score(
                self.keys.active_users(),
                ScoreBound::NegInf,
                ScoreBound::Inclusive(self.windows.active_users_cutoff(now)),
            )
            .remove_range_by_score(
                self.keys.sessions(),
                ScoreBound::NegInf,
                ScoreBound::Inclusive(self.windows.sessions_cutoff(now)),
            )
            .cardinality(self.keys.active_users())
            .cardinality(self.keys.sessions())
    }

    /// Run one prune cycle and publish the resulting gauges.
    ///
    /// # Errors
    ///
    /// Returns [`PruneError`] if the pipeline fails; no gauges are published
    /// in that case.
    pub async fn prune_once(&self) -> Result<WindowGauges, PruneError> {
        let now = self.clock.now_seconds();
        let replies = self.store.execute(&self.build_pipeline(now)).await?;

        let integer = |index: usize| -> Result<i64, StoreError> {
            replies
                .get(index)
                .ok_or(StoreError::UnexpectedReply {
                    index,
                    expected: "integer",
                })?
                .integer(index)
        };

        let removed_users = integer(0)?;
        let removed_sessions = integer(1)?;
        let gauges = WindowGauges {
            active_users: cardinality(self.keys.active_users(), integer(2)?)?,
            active_sessions: cardinality(self.keys.sessions(), integer(3)?)?,
        };

        self.sink.publish(gauges);
        tracing::debug!(
            removed_users,
            removed_sessions,
            active_users = gauges.active_users,
            active_sessions = gauges.active_sessions,
            "Prune cycle complete"
        );
        Ok(gauges)
    }

    /// Run until a shutdown signal arrives.
    ///
    /// A failed cycle is logged and skipped; the loop always sleeps for the
    /// configured interval before the next one.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?self.config.interval, "Starting pruner");

        loop {
            match self.prune_once().await {
                Ok(_) => PrunerMetrics::record_cycle(),
                Err(e) => {
                    PrunerMetrics::record_error();
                    tracing::error!(error = %e, "Prune cycle failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        tracing::info!("Pruner stopped");
    }
}

fn cardinality(set: &str, value: i64) -> Result<u64, PruneError> {
    u64::try_from(value).map_err(|_| PruneError::InvalidCardinality {
        set: set.to_string(),
        value,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pulse_core::environment::epoch_seconds;
    use pulse_testing::{InMemoryAggregateStore, RecordingGaugeSink, test_clock};

    #[test]
    fn pipeline_removes_at_or_below_cutoff() {
        let store = InMemoryAggregateStore::new(Arc::new(test_clock()));
        let pruner = Pruner::new(
            Arc::new(store),
            Arc::new(test_clock()),
            Arc::new(RecordingGaugeSink::new()),
        );
        let pipeline = pruner.build_pipeline(1_000.0);

        assert_eq!(pipeline.len(), 4);
        assert_eq!(
            pipeline.ops()[0],
            pulse_core::store::StoreOp::RemoveRangeByScore {
                set: "analytics:active_users".to_string(),
                min: ScoreBound::NegInf,
                max: ScoreBound::Inclusive(700.0),
            }
        );
    }

    #[tokio::test]
    async fn failed_cycle_publishes_nothing() {
        let clock = Arc::new(test_clock());
        let store = InMemoryAggregateStore::new(clock.clone());
        let sink = RecordingGaugeSink::new();
        let pruner = Pruner::new(Arc::new(store.clone()), clock, Arc::new(sink.clone()));

        store.fail_next_round_trip("connection reset");
        assert!(matches!(
            pruner.prune_once().await,
            Err(PruneError::Store(StoreError::Transport(_)))
        ));
        assert!(sink.published().is_empty());

        let now = epoch_seconds(test_clock().now());
        store.seed_score("analytics:sessions", "s1", now);
        let gauges = pruner.prune_once().await.unwrap();
        assert_eq!(gauges.active_sessions, 1);
        assert_eq!(sink.last(), Some(gauges));
    }
}
