//! # Pulse Testing
//!
//! Testing utilities and in-memory backends for the Pulse analytics engine.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: consumer-group log with pending sets and reclaim
//! - [`InMemoryAggregateStore`]: sorted sets, hashes and TTLs driven by a clock
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//! - [`RecordingGaugeSink`]: captures published gauges
//!
//! Both backends support fault injection so error paths (unacknowledged
//! entries, skipped prune cycles, partially applied pipelines) can be
//! exercised without a real Redis.
//!
//! ## Example
//!
//! ```
//! use pulse_testing::{InMemoryAggregateStore, ManualClock, test_clock};
//! use pulse_core::store::{AggregateStore, Pipeline, ScoreUpdate};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let clock = Arc::new(ManualClock::from(test_clock()));
//! let store = InMemoryAggregateStore::new(clock.clone());
//!
//! let pipeline = Pipeline::new()
//!     .upsert("analytics:active_users", "u1", 1.0, ScoreUpdate::Overwrite)
//!     .cardinality("analytics:active_users");
//! let replies = store.execute(&pipeline).await.unwrap();
//! assert_eq!(replies[1].integer(1), Ok(1));
//! # });
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Poisoned locks only happen after a test already panicked

pub mod log_mocks;
pub mod store_mocks;

use chrono::{DateTime, Utc};
use pulse_core::environment::Clock;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use pulse_core::gauge::{GaugeSink, WindowGauges};
    use std::sync::{Arc, Mutex, RwLock};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use pulse_testing::mocks::FixedClock;
    /// use pulse_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when the test moves it.
    ///
    /// Cloning shares the underlying time, so a test can hold one handle
    /// while the engine holds another.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }

        /// Move forward by `by`
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap();
            let mut time = self.time.write().unwrap();
            *time += by;
        }
    }

    impl From<FixedClock> for ManualClock {
        fn from(clock: FixedClock) -> Self {
            Self::new(clock.time)
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Gauge sink that keeps every published value.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingGaugeSink {
        published: Arc<Mutex<Vec<WindowGauges>>>,
    }

    impl RecordingGaugeSink {
        /// Create an empty sink
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All values published so far, oldest first
        #[must_use]
        pub fn published(&self) -> Vec<WindowGauges> {
            self.published.lock().unwrap().clone()
        }

        /// The most recent value, if any
        #[must_use]
        pub fn last(&self) -> Option<WindowGauges> {
            self.published.lock().unwrap().last().copied()
        }
    }

    impl GaugeSink for RecordingGaugeSink {
        fn publish(&self, gauges: WindowGauges) {
            self.published.lock().unwrap().push(gauges);
        }
    }
}

// Re-export commonly used items
pub use log_mocks::InMemoryEventLog;
pub use mocks::{FixedClock, ManualClock, RecordingGaugeSink, test_clock};
pub use store_mocks::InMemoryAggregateStore;
