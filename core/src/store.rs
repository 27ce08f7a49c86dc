//! Aggregate store abstraction.
//!
//! The engine talks to its key-value store exclusively through pipelines of
//! [`StoreOp`]s. A [`Pipeline`] is submitted as one unit; the backend runs
//! each command atomically, but the pipeline as a whole is **not** a
//! cross-key transaction. If a command fails part-way, the commands before
//! it may already be applied. The engine treats that as a failed unit of
//! work and relies on redelivery.
//!
//! # Operations
//!
//! | Op                       | Redis equivalent      | Reply                      |
//! |--------------------------|-----------------------|----------------------------|
//! | [`StoreOp::Upsert`]      | `ZADD [GT]`           | `Integer` (members added)  |
//! | [`StoreOp::IncrementField`] | `HINCRBY`          | `Integer` (new value)      |
//! | [`StoreOp::Expire`]      | `EXPIRE`              | `Integer` (1 if key exists)|
//! | [`StoreOp::RemoveRangeByScore`] | `ZREMRANGEBYSCORE` | `Integer` (removed)    |
//! | [`StoreOp::Cardinality`] | `ZCARD`               | `Integer`                  |
//! | [`StoreOp::RangeByScore`]| `ZRANGEBYSCORE`       | `Members` (ascending score)|
//! | [`StoreOp::CountByScore`]| `ZCOUNT`              | `Integer`                  |
//! | [`StoreOp::GetHash`]     | `HGETALL`             | `Fields`                   |
//!
//! # Example
//!
//! ```
//! use pulse_core::store::{Pipeline, ScoreBound, ScoreUpdate};
//! use std::time::Duration;
//!
//! let pipeline = Pipeline::new()
//!     .upsert("analytics:active_users", "u1", 1_710_513_000.0, ScoreUpdate::Overwrite)
//!     .increment_field("analytics:views:1710513000", "/home", 1)
//!     .expire("analytics:views:1710513000", Duration::from_secs(1200))
//!     .cardinality("analytics:active_users");
//!
//! assert_eq!(pipeline.len(), 4);
//! ```

use crate::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during aggregate store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to connect to the store
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A command inside a pipeline failed
    #[error("Command {index} failed: {reason}")]
    CommandFailed {
        /// Position of the failing command in the pipeline
        index: usize,
        /// The reason for failure
        reason: String,
    },

    /// A reply did not have the shape its command implies
    #[error("Unexpected reply for command {index}: expected {expected}")]
    UnexpectedReply {
        /// Position of the command in the pipeline
        index: usize,
        /// The reply shape that was expected
        expected: &'static str,
    },

    /// The backend rejected the pipeline without naming the failing command
    #[error("Pipeline rejected: {0}")]
    Rejected(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for aggregate store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// How an upsert treats an existing member's score.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScoreUpdate {
    /// Last write wins: the new score always replaces the old one, so a late
    /// event can move a member's last-seen time backwards.
    #[default]
    Overwrite,
    /// Only move scores forward (`ZADD GT`). New members are always added.
    GreaterWins,
}

/// A bound of a score range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScoreBound {
    /// Negative infinity
    NegInf,
    /// Positive infinity
    PosInf,
    /// Includes the given score
    Inclusive(f64),
    /// Excludes the given score
    Exclusive(f64),
}

impl ScoreBound {
    /// Render the bound in Redis range syntax (`-inf`, `+inf`, `12.5`, `(12.5`).
    #[must_use]
    pub fn to_arg(&self) -> String {
        match self {
            Self::NegInf => "-inf".to_string(),
            Self::PosInf => "+inf".to_string(),
            Self::Inclusive(score) => format!("{score}"),
            Self::Exclusive(score) => format!("({score}"),
        }
    }

    /// Whether `score` satisfies this bound used as a range minimum.
    #[must_use]
    pub fn admits_from_below(&self, score: f64) -> bool {
        match *self {
            Self::NegInf => true,
            Self::PosInf => false,
            Self::Inclusive(min) => score >= min,
            Self::Exclusive(min) => score > min,
        }
    }

    /// Whether `score` satisfies this bound used as a range maximum.
    #[must_use]
    pub fn admits_from_above(&self, score: f64) -> bool {
        match *self {
            Self::NegInf => false,
            Self::PosInf => true,
            Self::Inclusive(max) => score <= max,
            Self::Exclusive(max) => score < max,
        }
    }
}

/// One command in a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreOp {
    /// Set `member`'s score in sorted set `set`
    Upsert {
        /// Sorted set key
        set: String,
        /// Member to add or update
        member: String,
        /// New score
        score: f64,
        /// Treatment of an existing score
        mode: ScoreUpdate,
    },
    /// Add `delta` to `field` of hash `hash`
    IncrementField {
        /// Hash key
        hash: String,
        /// Field to increment
        field: String,
        /// Amount to add
        delta: i64,
    },
    /// (Re)set the time-to-live of `key`
    Expire {
        /// Key to expire
        key: String,
        /// Time to live from now
        ttl: Duration,
    },
    /// Delete every member of `set` whose score lies in `[min, max]`
    RemoveRangeByScore {
        /// Sorted set key
        set: String,
        /// Lower bound
        min: ScoreBound,
        /// Upper bound
        max: ScoreBound,
    },
    /// Number of members in `set`
    Cardinality {
        /// Sorted set key
        set: String,
    },
    /// Members of `set` whose score lies in `[min, max]`, ascending by score
    RangeByScore {
        /// Sorted set key
        set: String,
        /// Lower bound
        min: ScoreBound,
        /// Upper bound
        max: ScoreBound,
    },
    /// Number of members of `set` whose score lies in `[min, max]`
    CountByScore {
        /// Sorted set key
        set: String,
        /// Lower bound
        min: ScoreBound,
        /// Upper bound
        max: ScoreBound,
    },
    /// All field/value pairs of hash `hash`
    GetHash {
        /// Hash key
        hash: String,
    },
}

impl StoreOp {
    /// Short command name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::IncrementField { .. } => "increment_field",
            Self::Expire { .. } => "expire",
            Self::RemoveRangeByScore { .. } => "remove_range_by_score",
            Self::Cardinality { .. } => "cardinality",
            Self::RangeByScore { .. } => "range_by_score",
            Self::CountByScore { .. } => "count_by_score",
            Self::GetHash { .. } => "get_hash",
        }
    }
}

/// Reply to one pipeline command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreReply {
    /// Integer reply (counts, new values, flags)
    Integer(i64),
    /// Sorted set members
    Members(Vec<String>),
    /// Hash field/value pairs in backend order
    Fields(Vec<(String, String)>),
}

impl StoreReply {
    /// Interpret the reply at pipeline position `index` as an integer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnexpectedReply`] for any other shape.
    pub fn integer(&self, index: usize) -> Result<i64> {
        match self {
            Self::Integer(value) => Ok(*value),
            _ => Err(StoreError::UnexpectedReply {
                index,
                expected: "integer",
            }),
        }
    }

    /// Interpret the reply at pipeline position `index` as sorted set members.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnexpectedReply`] for any other shape.
    pub fn into_members(self, index: usize) -> Result<Vec<String>> {
        match self {
            Self::Members(members) => Ok(members),
            _ => Err(StoreError::UnexpectedReply {
                index,
                expected: "members",
            }),
        }
    }

    /// Interpret the reply at pipeline position `index` as hash fields.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnexpectedReply`] for any other shape.
    pub fn into_fields(self, index: usize) -> Result<Vec<(String, String)>> {
        match self {
            Self::Fields(fields) => Ok(fields),
            _ => Err(StoreError::UnexpectedReply {
                index,
                expected: "fields",
            }),
        }
    }
}

/// An ordered batch of commands submitted in one round trip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pipeline {
    ops: SmallVec<[StoreOp; 8]>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary command.
    pub fn push(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    /// Append a sorted set upsert.
    #[must_use]
    pub fn upsert(
        mut self,
        set: impl Into<String>,
        member: impl Into<String>,
        score: f64,
        mode: ScoreUpdate,
    ) -> Self {
        self.push(StoreOp::Upsert {
            set: set.into(),
            member: member.into(),
            score,
            mode,
        });
        self
    }

    /// Append a hash field increment.
    #[must_use]
    pub fn increment_field(
        mut self,
        hash: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
    ) -> Self {
        self.push(StoreOp::IncrementField {
            hash: hash.into(),
            field: field.into(),
            delta,
        });
        self
    }

    /// Append an expiry update.
    #[must_use]
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.push(StoreOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    /// Append a score-range deletion.
    #[must_use]
    pub fn remove_range_by_score(
        mut self,
        set: impl Into<String>,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Self {
        self.push(StoreOp::RemoveRangeByScore {
            set: set.into(),
            min,
            max,
        });
        self
    }

    /// Append a cardinality read.
    #[must_use]
    pub fn cardinality(mut self, set: impl Into<String>) -> Self {
        self.push(StoreOp::Cardinality { set: set.into() });
        self
    }

    /// Append a score-range scan.
    #[must_use]
    pub fn range_by_score(
        mut self,
        set: impl Into<String>,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Self {
        self.push(StoreOp::RangeByScore {
            set: set.into(),
            min,
            max,
        });
        self
    }

    /// Append a score-range count.
    #[must_use]
    pub fn count_by_score(
        mut self,
        set: impl Into<String>,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Self {
        self.push(StoreOp::CountByScore {
            set: set.into(),
            min,
            max,
        });
        self
    }

    /// Append a full hash read.
    #[must_use]
    pub fn get_hash(mut self, hash: impl Into<String>) -> Self {
        self.push(StoreOp::GetHash { hash: hash.into() });
        self
    }

    /// The queued commands, in submission order.
    #[must_use]
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no commands are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Boxed future returned by [`AggregateStore::execute`].
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Trait for aggregate store implementations.
///
/// # Contract
///
/// - Replies are returned one per command, in submission order
/// - Each command is applied atomically on its own
/// - On failure, any subset of the other commands may have been applied,
///   including commands submitted after the failing one
/// - An empty pipeline succeeds with no replies and no round trip
pub trait AggregateStore: Send + Sync {
    /// Execute every command of `pipeline` in one round trip.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the round trip or any command fails.
    fn execute<'a>(&'a self, pipeline: &'a Pipeline) -> StoreFuture<'a, Vec<StoreReply>>;
}
