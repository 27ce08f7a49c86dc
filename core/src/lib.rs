//! # Pulse Core
//!
//! Core traits and types for the Pulse windowed analytics engine.
//!
//! Pulse consumes page and session telemetry from a durable ordered log and
//! maintains near-real-time windowed aggregates (active users, active
//! sessions, per-user session counts, top pages) in a key-value store. This
//! crate holds everything the engine and its backends agree on:
//!
//! - [`event`]: The telemetry event and its log-entry encoding
//! - [`keys`]: The persisted-state key layout
//! - [`window`]: Window lengths and bucket arithmetic
//! - [`log`]: The [`EventLog`](log::EventLog) trait (consumer groups, ack, reclaim)
//! - [`store`]: The [`AggregateStore`](store::AggregateStore) trait and pipeline ops
//! - [`gauge`]: The [`GaugeSink`](gauge::GaugeSink) trait for summary gauges
//! - [`environment`]: The [`Clock`](environment::Clock) abstraction
//!
//! ## Architecture
//!
//! ```text
//! gateway ──► EventLog ──► StreamConsumer ──► EventProcessor ──► AggregateStore
//!                                                                    ▲     ▲
//!                                                 Pruner ────────────┘     │
//!                                                 QueryEngine ─────────────┘
//! ```
//!
//! Backends live in separate crates: `pulse-redis` for production and
//! `pulse-testing` for in-memory tests.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use smallvec::{SmallVec, smallvec};

pub mod event;
pub mod gauge;
pub mod keys;
pub mod log;
pub mod store;
pub mod window;

/// Environment module - injected dependencies
///
/// Everything in the engine that needs "now" reads it through a [`Clock`]
/// so tests can pin or advance time deterministically.
///
/// [`Clock`]: environment::Clock
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use pulse_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;

        /// Get the current time as fractional seconds since the Unix epoch.
        ///
        /// This is the unit every score in the aggregate store uses.
        fn now_seconds(&self) -> f64 {
            epoch_seconds(self.now())
        }
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Convert a timestamp to fractional seconds since the Unix epoch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Microsecond precision is plenty for window scores
    pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
        time.timestamp_micros() as f64 / 1_000_000.0
    }
}
