//! In-memory event log with consumer groups.
//!
//! Each topic is a vector of entries. Each group keeps a delivery cursor
//! into that vector and a pending list of delivered-but-unacknowledged
//! entries, tagged with the consumer that holds them and when they were
//! last delivered. Idle time for reclaim is measured with the injected
//! [`Clock`]; blocking reads wait on a [`Notify`] for real time.

use chrono::{DateTime, Utc};
use pulse_core::environment::Clock;
use pulse_core::event::{EntryId, Fields, LogEntry};
use pulse_core::log::{ConsumerRef, EventLog, LogError, LogFuture, StartPosition};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Pending {
    position: usize,
    consumer: String,
    delivered_at: DateTime<Utc>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    cursor: usize,
    pending: Vec<Pending>,
}

#[derive(Debug, Default)]
struct Topic {
    entries: Vec<LogEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    next_seq: u64,
    fail_reads: Vec<String>,
    fail_acks: Vec<String>,
}

/// In-memory [`EventLog`] for tests.
///
/// Cloning shares state. Read and ack faults are injected one call at a
/// time and consumed in order.
#[derive(Clone)]
pub struct InMemoryEventLog {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventLog")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl InMemoryEventLog {
    /// Create an empty log whose idle times follow `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            appended: Arc::new(Notify::new()),
            clock,
        }
    }

    /// Make the next `read_batch` fail with `reason`.
    pub fn fail_next_read(&self, reason: impl Into<String>) {
        self.state.lock().unwrap().fail_reads.push(reason.into());
    }

    /// Make the next `ack` fail with `reason`.
    pub fn fail_next_ack(&self, reason: impl Into<String>) {
        self.state.lock().unwrap().fail_acks.push(reason.into());
    }

    /// Number of entries ever appended to `topic`.
    #[must_use]
    pub fn len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .map_or(0, |topic| topic.entries.len())
    }

    /// Whether `topic` has no entries.
    #[must_use]
    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// All entries of `topic`, in append order.
    #[must_use]
    pub fn entries(&self, topic: &str) -> Vec<LogEntry> {
        self.state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .map(|topic| topic.entries.clone())
            .unwrap_or_default()
    }

    /// Whether `group` exists on `topic`.
    #[must_use]
    pub fn group_exists(&self, topic: &str, group: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .is_some_and(|topic| topic.groups.contains_key(group))
    }

    /// Identifiers pending in `group`, held by any consumer, in log order.
    #[must_use]
    pub fn pending(&self, topic: &str, group: &str) -> Vec<EntryId> {
        self.pending_matching(topic, group, |_| true)
    }

    /// Identifiers pending in `group` and held by `consumer`, in log order.
    #[must_use]
    pub fn pending_for(&self, topic: &str, group: &str, consumer: &str) -> Vec<EntryId> {
        self.pending_matching(topic, group, |pending| pending.consumer == consumer)
    }

    /// How many times the entry `id` has been delivered to `group`.
    #[must_use]
    pub fn delivery_count(&self, topic: &str, group: &str, id: &EntryId) -> u32 {
        let state = self.state.lock().unwrap();
        let Some(topic) = state.topics.get(topic) else {
            return 0;
        };
        topic
            .groups
            .get(group)
            .and_then(|group| {
                group
                    .pending
                    .iter()
                    .find(|pending| &topic.entries[pending.position].id == id)
            })
            .map_or(0, |pending| pending.deliveries)
    }

    fn pending_matching(
        &self,
        topic: &str,
        group: &str,
        keep: impl Fn(&Pending) -> bool,
    ) -> Vec<EntryId> {
        let state = self.state.lock().unwrap();
        let Some(topic) = state.topics.get(topic) else {
            return Vec::new();
        };
        let Some(group) = topic.groups.get(group) else {
            return Vec::new();
        };
        let mut pending: Vec<&Pending> = group.pending.iter().filter(|p| keep(p)).collect();
        pending.sort_by_key(|p| p.position);
        pending
            .into_iter()
            .map(|p| topic.entries[p.position].id.clone())
            .collect()
    }

    fn deliver_new(
        &self,
        consumer: &ConsumerRef,
        max_count: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        if !state.fail_reads.is_empty() {
            let reason = state.fail_reads.remove(0);
            return Err(LogError::ReadFailed {
                topic: consumer.topic.clone(),
                reason,
            });
        }

        let no_group = || {
            LogError::ConsumerGroup(format!(
                "NOGROUP no such key '{}' or consumer group '{}'",
                consumer.topic, consumer.group
            ))
        };
        let topic = state.topics.get_mut(&consumer.topic).ok_or_else(no_group)?;
        let group = topic.groups.get_mut(&consumer.group).ok_or_else(no_group)?;

        let end = topic.entries.len().min(group.cursor + max_count);
        let batch: Vec<LogEntry> = topic.entries[group.cursor..end].to_vec();
        for position in group.cursor..end {
            group.pending.push(Pending {
                position,
                consumer: consumer.consumer.clone(),
                delivered_at: now,
                deliveries: 1,
            });
        }
        group.cursor = end;
        Ok(batch)
    }
}

impl EventLog for InMemoryEventLog {
    fn create_group<'a>(
        &'a self,
        topic: &'a str,
        group: &'a str,
        start: StartPosition,
    ) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let topic = state.topics.entry(topic.to_string()).or_default();
            let cursor = match start {
                StartPosition::Origin => 0,
                StartPosition::Latest => topic.entries.len(),
            };
            topic.groups.entry(group.to_string()).or_insert(Group {
                cursor,
                pending: Vec::new(),
            });
            Ok(())
        })
    }

    fn read_batch<'a>(
        &'a self,
        consumer: &'a ConsumerRef,
        max_count: usize,
        block: Duration,
    ) -> LogFuture<'a, Vec<LogEntry>> {
        Box::pin(async move {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.deliver_new(consumer, max_count)?;
            if !batch.is_empty() || block.is_zero() {
                return Ok(batch);
            }

            let _ = tokio::time::timeout(block, notified).await;
            self.deliver_new(consumer, max_count)
        })
    }

    fn ack<'a>(&'a self, topic: &'a str, group: &'a str, id: &'a EntryId) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if !state.fail_acks.is_empty() {
                let reason = state.fail_acks.remove(0);
                return Err(LogError::AckFailed {
                    entry_id: id.to_string(),
                    reason,
                });
            }

            if let Some(topic) = state.topics.get_mut(topic) {
                let entries = &topic.entries;
                if let Some(group) = topic.groups.get_mut(group) {
                    group
                        .pending
                        .retain(|pending| &entries[pending.position].id != id);
                }
            }
            Ok(())
        })
    }

    fn append<'a>(&'a self, topic: &'a str, fields: &'a Fields) -> LogFuture<'a, EntryId> {
        Box::pin(async move {
            let id = {
                let mut state = self.state.lock().unwrap();
                let seq = state.next_seq;
                state.next_seq += 1;
                let id = EntryId::new(format!("{}-{seq}", self.clock.now().timestamp_millis()));
                state
                    .topics
                    .entry(topic.to_string())
                    .or_default()
                    .entries
                    .push(LogEntry::new(id.clone(), fields.clone()));
                id
            };
            self.appended.notify_waiters();
            Ok(id)
        })
    }

    fn claim_idle<'a>(
        &'a self,
        consumer: &'a ConsumerRef,
        min_idle: Duration,
        count: usize,
    ) -> LogFuture<'a, Vec<LogEntry>> {
        Box::pin(async move {
            let now = self.clock.now();
            let min_idle = chrono::Duration::from_std(min_idle)
                .map_err(|e| LogError::ReadFailed {
                    topic: consumer.topic.clone(),
                    reason: e.to_string(),
                })?;

            let mut state = self.state.lock().unwrap();
            let Some(topic) = state.topics.get_mut(&consumer.topic) else {
                return Ok(Vec::new());
            };
            let Some(group) = topic.groups.get_mut(&consumer.group) else {
                return Err(LogError::ConsumerGroup(format!(
                    "NOGROUP no such consumer group '{}'",
                    consumer.group
                )));
            };

            group.pending.sort_by_key(|pending| pending.position);
            let mut claimed = Vec::new();
            for pending in &mut group.pending {
                if claimed.len() == count {
                    break;
                }
                if now - pending.delivered_at >= min_idle {
                    pending.consumer = consumer.consumer.clone();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    claimed.push(topic.entries[pending.position].clone());
                }
            }
            Ok(claimed)
        })
    }
}
