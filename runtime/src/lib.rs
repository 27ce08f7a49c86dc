//! # Pulse Runtime
//!
//! The moving parts of the Pulse analytics engine.
//!
//! ## Core Components
//!
//! - **[`StreamConsumer`]**: Pulls batches from the log, processes them and
//!   acknowledges only what succeeded
//! - **[`EventProcessor`]**: Turns one event into one aggregate pipeline
//! - **[`Pruner`]**: Sweeps the global windows and publishes gauges
//! - **[`QueryEngine`]**: Answers dashboard queries
//! - **[`EventPublisher`]**: Appends events to the log
//! - **[`Worker`]**: Runs the consumer and the pruner until shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use pulse_core::environment::SystemClock;
//! use pulse_core::gauge::NoopGaugeSink;
//! use pulse_runtime::{ConsumerConfig, EventProcessor, Pruner, StreamConsumer, Worker};
//! use pulse_testing::{InMemoryAggregateStore, InMemoryEventLog};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let clock = Arc::new(SystemClock);
//! let log = Arc::new(InMemoryEventLog::new(clock.clone()));
//! let store = Arc::new(InMemoryAggregateStore::new(clock.clone()));
//!
//! let consumer = StreamConsumer::new(
//!     log,
//!     EventProcessor::new(store.clone()),
//!     ConsumerConfig::default(),
//!     clock.clone(),
//! );
//! let pruner = Pruner::new(store, clock, Arc::new(NoopGaugeSink));
//!
//! let report = Worker::new(consumer, pruner)
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//! assert!(report.is_clean());
//! # }
//! ```

/// Stream consumer loop and reclaim sweep
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

/// Per-event aggregate updates
pub mod processor;

/// Global window pruning
pub mod pruner;

/// Event submission
pub mod publisher;

/// Aggregate queries
pub mod query;

/// Consumer and pruner lifecycle
pub mod worker;

pub use consumer::{BatchOutcome, ConsumerConfig, ReclaimPolicy, StreamConsumer};
pub use processor::{EventProcessor, ProcessError};
pub use pruner::{PruneError, Pruner, PrunerConfig};
pub use publisher::EventPublisher;
pub use query::{MetricsSnapshot, PageCount, QueryEngine, QueryError};
pub use worker::{ShutdownReport, TaskExit, Worker};
