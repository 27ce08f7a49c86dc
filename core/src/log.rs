//! Durable ordered log abstraction.
//!
//! This module provides the [`EventLog`] trait: an append-only, per-topic log
//! with consumer groups. Each group owns a delivery cursor and, per consumer,
//! a pending set of entries that were delivered but not yet acknowledged.
//!
//! # Delivery Semantics
//!
//! ```text
//! append ──► [ e1 e2 e3 e4 e5 ]
//!                      ▲
//!                      └── group cursor (advances on read, not on ack)
//!
//! read_batch("new") ──► e3 e4 ──► pending[consumer] += {e3, e4}
//! ack(e3)           ──► pending[consumer] -= {e3}
//! ```
//!
//! - **At-least-once**: reading advances the cursor; an entry that is never
//!   acknowledged stays pending instead of being lost
//! - **No automatic redelivery**: "new entries" reads never return pending
//!   entries; [`EventLog::claim_idle`] is the explicit reclaim path
//! - **Competing consumers**: consumers sharing a group split the entries
//!
//! # Implementations
//!
//! - `RedisEventLog` (`pulse-redis`) - Redis Streams
//! - `InMemoryEventLog` (`pulse-testing`) - For tests

use crate::event::{EntryId, Fields, LogEntry};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Failed to connect to the log backend
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to append an entry to a topic
    #[error("Append failed for topic '{topic}': {reason}")]
    AppendFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to read from a topic
    #[error("Read failed for topic '{topic}': {reason}")]
    ReadFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to acknowledge an entry
    #[error("Ack failed for entry '{entry_id}': {reason}")]
    AckFailed {
        /// The entry that could not be acknowledged
        entry_id: String,
        /// The reason for failure
        reason: String,
    },

    /// Consumer group error (missing group, creation failure)
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Where a newly created consumer group starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// From the first entry ever appended (`0`)
    #[default]
    Origin,
    /// Only entries appended after the group is created (`$`)
    Latest,
}

/// Addresses one consumer inside one group on one topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerRef {
    /// Log topic (e.g. `events_stream`)
    pub topic: String,
    /// Consumer group name (e.g. `analytics_group`)
    pub group: String,
    /// Consumer name within the group (e.g. `worker_1`)
    pub consumer: String,
}

impl ConsumerRef {
    /// Create a consumer reference.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// Boxed future returned by [`EventLog`] methods.
pub type LogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LogError>> + Send + 'a>>;

/// Trait for durable ordered log implementations.
///
/// # Dyn Compatibility
///
/// Methods return [`LogFuture`] instead of using `async fn` so the engine can
/// hold an `Arc<dyn EventLog>` and swap backends at startup.
pub trait EventLog: Send + Sync {
    /// Ensure `group` exists on `topic`, creating the topic if necessary.
    ///
    /// Idempotent: a group that already exists is a success.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ConsumerGroup`] if the group cannot be created.
    fn create_group<'a>(
        &'a self,
        topic: &'a str,
        group: &'a str,
        start: StartPosition,
    ) -> LogFuture<'a, ()>;

    /// Read up to `max_count` entries never delivered to this group.
    ///
    /// Waits up to `block` when nothing is ready. An empty result is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ReadFailed`] or [`LogError::Transport`] on backend
    /// failure.
    fn read_batch<'a>(
        &'a self,
        consumer: &'a ConsumerRef,
        max_count: usize,
        block: Duration,
    ) -> LogFuture<'a, Vec<LogEntry>>;

    /// Acknowledge an entry, removing it from the pending set.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AckFailed`] on backend failure.
    fn ack<'a>(&'a self, topic: &'a str, group: &'a str, id: &'a EntryId) -> LogFuture<'a, ()>;

    /// Append an entry to `topic` and return its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AppendFailed`] on backend failure.
    fn append<'a>(&'a self, topic: &'a str, fields: &'a Fields) -> LogFuture<'a, EntryId>;

    /// Transfer up to `count` entries that have been pending in the group for
    /// at least `min_idle` to `consumer`, and return them.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ReadFailed`] or [`LogError::Transport`] on backend
    /// failure.
    fn claim_idle<'a>(
        &'a self,
        consumer: &'a ConsumerRef,
        min_idle: Duration,
        count: usize,
    ) -> LogFuture<'a, Vec<LogEntry>>;
}
