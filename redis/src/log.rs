//! Redis Streams implementation of [`EventLog`].

use crate::connect;
use pulse_core::event::{EntryId, Fields, LogEntry};
use pulse_core::log::{ConsumerRef, EventLog, LogError, LogFuture, StartPosition};
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions};
use redis::{AsyncCommands, RedisError, Value};
use std::time::Duration;

/// Redis Streams event log.
///
/// Topics map to stream keys, consumer groups to stream consumer groups.
/// Pending entries live in the group's PEL and are reclaimed with
/// `XAUTOCLAIM`.
///
/// # Example
///
/// ```no_run
/// use pulse_redis::RedisEventLog;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Cap the stream at roughly one million entries
/// let log = RedisEventLog::builder()
///     .url("redis://127.0.0.1:6379")
///     .max_len(1_000_000)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisEventLog {
    /// Connection manager (reconnects automatically)
    conn: ConnectionManager,
    /// Approximate `MAXLEN` applied on append
    max_len: Option<usize>,
}

impl RedisEventLog {
    /// Connect to `url` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ConnectionFailed`] if Redis is unreachable.
    pub async fn new(url: &str) -> Result<Self, LogError> {
        Self::builder().url(url).build().await
    }

    /// Create a new builder for configuring the log.
    #[must_use]
    pub fn builder() -> RedisEventLogBuilder {
        RedisEventLogBuilder::default()
    }
}

/// Builder for configuring a [`RedisEventLog`].
#[derive(Debug, Default)]
pub struct RedisEventLogBuilder {
    url: Option<String>,
    max_len: Option<usize>,
}

impl RedisEventLogBuilder {
    /// Set the Redis URL (e.g. `redis://127.0.0.1:6379/0`).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Trim streams to approximately `max_len` entries on every append.
    ///
    /// Default: unbounded.
    #[must_use]
    pub const fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Connect and build the [`RedisEventLog`].
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ConnectionFailed`] if the URL is missing or
    /// invalid, or Redis is unreachable.
    pub async fn build(self) -> Result<RedisEventLog, LogError> {
        let url = self
            .url
            .ok_or_else(|| LogError::ConnectionFailed("Redis URL not configured".to_string()))?;
        let conn = connect(&url).await.map_err(LogError::ConnectionFailed)?;

        tracing::info!(
            max_len = ?self.max_len,
            "RedisEventLog created successfully"
        );

        Ok(RedisEventLog {
            conn,
            max_len: self.max_len,
        })
    }
}

fn is_transport(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn read_error(topic: &str, e: &RedisError) -> LogError {
    if e.code() == Some("NOGROUP") {
        LogError::ConsumerGroup(e.to_string())
    } else if is_transport(e) {
        LogError::Transport(e.to_string())
    } else {
        LogError::ReadFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        }
    }
}

fn millis(duration: Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX)
}

/// Text of a reply element. Non-UTF-8 bytes are replaced rather than
/// rejected, so one odd producer cannot poison a batch.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::VerbatimString { text, .. } => Some(text.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_fields(value: &Value) -> Option<Fields> {
    match value {
        Value::Array(items) if items.len() % 2 == 0 => items
            .chunks_exact(2)
            .map(|pair| Some((text(&pair[0])?, text(&pair[1])?)))
            .collect(),
        Value::Map(pairs) => pairs
            .iter()
            .map(|(name, value)| Some((text(name)?, text(value)?)))
            .collect(),
        _ => None,
    }
}

/// Decode one `[id, [field, value, ...]]` stream entry.
///
/// Entries deleted from the stream while pending come back as nil (or with
/// nil fields) and yield `None`. An entry whose fields cannot be read is
/// kept with no fields, so it decodes to an empty event and is still
/// acknowledged instead of being reclaimed forever.
fn decode_entry(entry: &Value) -> Option<LogEntry> {
    let Value::Array(parts) = entry else {
        if !matches!(entry, Value::Nil) {
            tracing::warn!(entry = ?entry, "Skipping malformed stream entry");
        }
        return None;
    };
    let id = parts.first().and_then(text);
    match (id, parts.get(1)) {
        (Some(_), None | Some(Value::Nil)) => None,
        (Some(id), Some(fields)) => match decode_fields(fields) {
            Some(fields) => Some(LogEntry::new(id, fields)),
            None => {
                tracing::warn!(entry_id = %id, "Stream entry has malformed fields");
                Some(LogEntry::new(id, Fields::new()))
            }
        },
        (None, _) => {
            tracing::warn!(entry = ?entry, "Skipping stream entry without an id");
            None
        }
    }
}

fn decode_entries(entries: &[Value]) -> Vec<LogEntry> {
    entries.iter().filter_map(decode_entry).collect()
}

/// Pull the entries out of an `XREADGROUP` reply: nil when nothing arrived,
/// otherwise `[[stream, [entry, ...]], ...]` (or a map keyed by stream).
fn parse_read(reply: &Value) -> Result<Vec<LogEntry>, String> {
    let streams: Vec<&Value> = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) => streams
            .iter()
            .map(|stream| match stream {
                Value::Array(parts) if parts.len() == 2 => Ok(&parts[1]),
                other => Err(format!("unexpected XREADGROUP stream: {other:?}")),
            })
            .collect::<Result<_, _>>()?,
        Value::Map(pairs) => pairs.iter().map(|(_, entries)| entries).collect(),
        other => return Err(format!("unexpected XREADGROUP reply: {other:?}")),
    };

    let mut entries = Vec::new();
    for stream in streams {
        match stream {
            Value::Array(items) => entries.extend(decode_entries(items)),
            Value::Nil => {}
            other => return Err(format!("unexpected XREADGROUP entries: {other:?}")),
        }
    }
    Ok(entries)
}

/// Pull the claimed entries out of an `XAUTOCLAIM` reply:
/// `[next_cursor, [[id, [field, value, ...]], ...], deleted_ids?]`.
fn parse_claimed(reply: &Value) -> Result<Vec<LogEntry>, String> {
    match reply {
        Value::Array(parts) => match parts.get(1) {
            Some(Value::Array(entries)) => Ok(decode_entries(entries)),
            other => Err(format!("unexpected XAUTOCLAIM entries: {other:?}")),
        },
        other => Err(format!("unexpected XAUTOCLAIM reply: {other:?}")),
    }
}

impl EventLog for RedisEventLog {
    fn create_group<'a>(
        &'a self,
        topic: &'a str,
        group: &'a str,
        start: StartPosition,
    ) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let start_id = match start {
                StartPosition::Origin => "0",
                StartPosition::Latest => "$",
            };

            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(topic, group, start_id).await;
            match created {
                Ok(()) => {
                    tracing::info!(topic = %topic, group = %group, "Created consumer group");
                    Ok(())
                }
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    tracing::debug!(topic = %topic, group = %group, "Consumer group already exists");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(
                        topic = %topic,
                        group = %group,
                        error = %e,
                        "Failed to create consumer group"
                    );
                    Err(LogError::ConsumerGroup(format!(
                        "Failed to create group '{group}' on '{topic}': {e}"
                    )))
                }
            }
        })
    }

    fn read_batch<'a>(
        &'a self,
        consumer: &'a ConsumerRef,
        max_count: usize,
        block: Duration,
    ) -> LogFuture<'a, Vec<LogEntry>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut options = StreamReadOptions::default()
                .group(&consumer.group, &consumer.consumer)
                .count(max_count);
            // BLOCK 0 means "forever" to Redis; a zero block here means "don't block".
            if !block.is_zero() {
                options = options.block(millis(block));
            }

            let reply: Value = conn
                .xread_options(&[consumer.topic.as_str()], &[">"], &options)
                .await
                .map_err(|e| read_error(&consumer.topic, &e))?;

            let entries = parse_read(&reply).map_err(|reason| LogError::ReadFailed {
                topic: consumer.topic.clone(),
                reason,
            })?;

            tracing::trace!(
                topic = %consumer.topic,
                consumer = %consumer.consumer,
                count = entries.len(),
                "Read batch"
            );
            Ok(entries)
        })
    }

    fn ack<'a>(&'a self, topic: &'a str, group: &'a str, id: &'a EntryId) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = conn
                .xack(topic, group, &[id.as_str()])
                .await
                .map_err(|e| LogError::AckFailed {
                    entry_id: id.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(())
        })
    }

    fn append<'a>(&'a self, topic: &'a str, fields: &'a Fields) -> LogFuture<'a, EntryId> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let items: Vec<(&str, &str)> = fields
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect();

            let appended: redis::RedisResult<String> = match self.max_len {
                Some(max_len) => {
                    let max_len = StreamMaxlen::Approx(max_len);
                    conn.xadd_maxlen(topic, max_len, "*", items.as_slice()).await
                }
                None => conn.xadd(topic, "*", items.as_slice()).await,
            };

            match appended {
                Ok(id) => {
                    tracing::debug!(topic = %topic, entry_id = %id, "Appended entry");
                    Ok(EntryId::new(id))
                }
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "Failed to append entry");
                    Err(LogError::AppendFailed {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        })
    }

    fn claim_idle<'a>(
        &'a self,
        consumer: &'a ConsumerRef,
        min_idle: Duration,
        count: usize,
    ) -> LogFuture<'a, Vec<LogEntry>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let reply: Value = redis::cmd("XAUTOCLAIM")
                .arg(&consumer.topic)
                .arg(&consumer.group)
                .arg(&consumer.consumer)
                .arg(millis(min_idle))
                .arg("0-0")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await
                .map_err(|e| read_error(&consumer.topic, &e))?;

            parse_claimed(&reply).map_err(|reason| LogError::ReadFailed {
                topic: consumer.topic.clone(),
                reason,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_autoclaim_reply() {
        let reply = Value::Array(vec![
            bulk("0-0"),
            Value::Array(vec![
                Value::Array(vec![
                    bulk("1710513000000-0"),
                    Value::Array(vec![bulk("user_id"), bulk("u1"), bulk("page_url"), bulk("/home")]),
                ]),
                Value::Nil,
            ]),
            Value::Array(vec![]),
        ]);

        let claimed = parse_claimed(&reply).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id.as_str(), "1710513000000-0");
        assert_eq!(claimed[0].fields["user_id"], "u1");
        assert_eq!(claimed[0].fields["page_url"], "/home");
    }

    #[test]
    fn undecodable_entry_does_not_drop_its_siblings() {
        let reply = Value::Array(vec![
            bulk("0-0"),
            Value::Array(vec![
                Value::Array(vec![
                    bulk("1-0"),
                    Value::Array(vec![bulk("user_id"), bulk("good")]),
                ]),
                Value::Array(vec![
                    bulk("2-0"),
                    Value::Array(vec![bulk("user_id"), Value::BulkString(vec![0xFF, 0xFE])]),
                ]),
                Value::Array(vec![bulk("3-0"), Value::Array(vec![bulk("dangling")])]),
            ]),
        ]);

        let claimed = parse_claimed(&reply).unwrap();
        let ids: Vec<&str> = claimed.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["1-0", "2-0", "3-0"]);
        assert_eq!(claimed[0].fields["user_id"], "good");
        assert_eq!(claimed[1].fields["user_id"], "\u{FFFD}\u{FFFD}");
        assert!(claimed[2].fields.is_empty());
    }

    #[test]
    fn parses_read_reply_entry_by_entry() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("events_stream"),
            Value::Array(vec![
                Value::Array(vec![
                    bulk("1-0"),
                    Value::Array(vec![bulk("page_url"), Value::BulkString(vec![b'/', 0xC3])]),
                ]),
                Value::Array(vec![
                    bulk("2-0"),
                    Value::Array(vec![bulk("session_id"), bulk("s1")]),
                ]),
            ]),
        ])]);

        let entries = parse_read(&reply).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fields["page_url"], "/\u{FFFD}");
        assert_eq!(entries[1].fields["session_id"], "s1");

        assert!(parse_read(&Value::Nil).unwrap().is_empty());
        assert!(parse_read(&Value::Int(1)).is_err());
    }

    #[test]
    fn rejects_malformed_autoclaim_reply() {
        assert!(parse_claimed(&Value::Int(3)).is_err());
        assert!(parse_claimed(&Value::Array(vec![bulk("0-0")])).is_err());
    }

    #[test]
    fn block_converts_to_millis() {
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::ZERO), 0);
    }
}
