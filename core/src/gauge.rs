//! Summary gauges published after every prune cycle.
//!
//! The pruner owns the gauge values and pushes them through a [`GaugeSink`];
//! nothing in the engine writes to process-global gauge state directly. The
//! Prometheus sink lives in `pulse-runtime`, a recording sink for tests in
//! `pulse-testing`.

use serde::{Deserialize, Serialize};

/// Window cardinalities observed right after a prune.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGauges {
    /// Members of the active-user window
    pub active_users: u64,
    /// Members of the session window
    pub active_sessions: u64,
}

/// Destination for [`WindowGauges`].
pub trait GaugeSink: Send + Sync {
    /// Publish the latest gauge values.
    fn publish(&self, gauges: WindowGauges);
}

/// Sink that drops every value. Handy when gauges are not exported.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGaugeSink;

impl GaugeSink for NoopGaugeSink {
    fn publish(&self, _gauges: WindowGauges) {}
}
