//! Redis implementation of [`AggregateStore`].
//!
//! Every [`Pipeline`] becomes one `MULTI`/`EXEC` round trip. Ops map
//! one-to-one onto commands:
//!
//! | Op                   | Command                               |
//! |----------------------|---------------------------------------|
//! | `Upsert`             | `ZADD key [GT] score member`          |
//! | `IncrementField`     | `HINCRBY key field delta`             |
//! | `Expire`             | `EXPIRE key seconds`                  |
//! | `RemoveRangeByScore` | `ZREMRANGEBYSCORE key min max`        |
//! | `Cardinality`        | `ZCARD key`                           |
//! | `RangeByScore`       | `ZRANGEBYSCORE key min max`           |
//! | `CountByScore`       | `ZCOUNT key min max`                  |
//! | `GetHash`            | `HGETALL key`                         |
//!
//! `EXEC` does not roll back: a command that fails at run time (e.g.
//! `WRONGTYPE`) leaves every other command of the transaction applied,
//! including the ones queued after it. The client reports such a failure
//! for the transaction as a whole, so it surfaces as
//! [`StoreError::Rejected`] without the failing index.

use crate::connect;
use pulse_core::store::{
    AggregateStore, Pipeline, Result, ScoreUpdate, StoreError, StoreFuture, StoreOp, StoreReply,
};
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, RedisError, Value};

/// Redis aggregate store.
///
/// # Example
///
/// ```no_run
/// use pulse_redis::RedisAggregateStore;
/// use pulse_core::store::{AggregateStore, Pipeline};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RedisAggregateStore::new("redis://127.0.0.1:6379").await?;
/// let replies = store
///     .execute(&Pipeline::new().cardinality("analytics:active_users"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisAggregateStore {
    /// Connection manager (reconnects automatically)
    conn: ConnectionManager,
}

impl RedisAggregateStore {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionFailed`] if Redis is unreachable.
    pub async fn new(url: &str) -> Result<Self> {
        let conn = connect(url).await.map_err(StoreError::ConnectionFailed)?;
        Ok(Self { conn })
    }
}

fn queue(pipe: &mut redis::Pipeline, op: &StoreOp) {
    match op {
        StoreOp::Upsert {
            set,
            member,
            score,
            mode,
        } => {
            pipe.cmd("ZADD").arg(set);
            if *mode == ScoreUpdate::GreaterWins {
                pipe.arg("GT");
            }
            pipe.arg(*score).arg(member);
        }
        StoreOp::IncrementField { hash, field, delta } => {
            pipe.hincr(hash, field, *delta);
        }
        StoreOp::Expire { key, ttl } => {
            let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
            pipe.expire(key, seconds);
        }
        StoreOp::RemoveRangeByScore { set, min, max } => {
            pipe.zrembyscore(set, min.to_arg(), max.to_arg());
        }
        StoreOp::Cardinality { set } => {
            pipe.zcard(set);
        }
        StoreOp::RangeByScore { set, min, max } => {
            pipe.zrangebyscore(set, min.to_arg(), max.to_arg());
        }
        StoreOp::CountByScore { set, min, max } => {
            pipe.zcount(set, min.to_arg(), max.to_arg());
        }
        StoreOp::GetHash { hash } => {
            pipe.hgetall(hash);
        }
    }
}

fn field_pairs(value: &Value) -> Option<Vec<(String, String)>> {
    match value {
        Value::Array(items) if items.len() % 2 == 0 => items
            .chunks_exact(2)
            .map(|pair| {
                Some((
                    String::from_redis_value(&pair[0]).ok()?,
                    String::from_redis_value(&pair[1]).ok()?,
                ))
            })
            .collect(),
        Value::Map(pairs) => pairs
            .iter()
            .map(|(name, value)| {
                Some((
                    String::from_redis_value(name).ok()?,
                    String::from_redis_value(value).ok()?,
                ))
            })
            .collect(),
        _ => None,
    }
}

fn reply_error(index: usize, e: &RedisError, expected: &'static str) -> StoreError {
    tracing::debug!(index, error = %e, "Unexpected Redis reply");
    StoreError::UnexpectedReply { index, expected }
}

fn convert(index: usize, op: &StoreOp, value: &Value) -> Result<StoreReply> {
    match op {
        StoreOp::RangeByScore { .. } => Vec::<String>::from_redis_value(value)
            .map(StoreReply::Members)
            .map_err(|e| reply_error(index, &e, "members")),
        StoreOp::GetHash { .. } => match field_pairs(value) {
            Some(fields) => Ok(StoreReply::Fields(fields)),
            None => Err(i64::from_redis_value(value).map_or_else(
                |e| reply_error(index, &e, "fields"),
                |_| StoreError::UnexpectedReply {
                    index,
                    expected: "fields",
                },
            )),
        },
        _ => i64::from_redis_value(value)
            .map(StoreReply::Integer)
            .map_err(|e| reply_error(index, &e, "integer")),
    }
}

fn store_error(e: &RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Transport(e.to_string())
    } else {
        StoreError::Rejected(e.to_string())
    }
}

impl AggregateStore for RedisAggregateStore {
    fn execute<'a>(&'a self, pipeline: &'a Pipeline) -> StoreFuture<'a, Vec<StoreReply>> {
        Box::pin(async move {
            if pipeline.is_empty() {
                return Ok(Vec::new());
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in pipeline.ops() {
                queue(&mut pipe, op);
            }

            let mut conn = self.conn.clone();
            let values: Vec<Value> = pipe.query_async(&mut conn).await.map_err(|e| {
                tracing::warn!(
                    commands = pipeline.len(),
                    error = %e,
                    "Redis pipeline failed"
                );
                store_error(&e)
            })?;

            if values.len() != pipeline.len() {
                return Err(StoreError::Rejected(format!(
                    "expected {} replies, got {}",
                    pipeline.len(),
                    values.len()
                )));
            }

            pipeline
                .ops()
                .iter()
                .zip(&values)
                .enumerate()
                .map(|(index, (op, value))| convert(index, op, value))
                .collect()
        })
    }
}
