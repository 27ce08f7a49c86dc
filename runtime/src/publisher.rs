//! Event submission onto the log.

use crate::consumer::DEFAULT_TOPIC;
use pulse_core::event::{EntryId, Event};
use pulse_core::log::{EventLog, LogError};
use std::sync::Arc;

/// Appends events to a log topic.
///
/// Events are encoded as flat string fields with an RFC 3339 timestamp,
/// which is exactly what [`ReceivedEvent::decode`] reads back.
///
/// [`ReceivedEvent::decode`]: pulse_core::event::ReceivedEvent::decode
#[derive(Clone)]
pub struct EventPublisher {
    log: Arc<dyn EventLog>,
    topic: String,
}

impl EventPublisher {
    /// Publish to the default topic.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self::with_topic(log, DEFAULT_TOPIC)
    }

    /// Publish to `topic`.
    #[must_use]
    pub fn with_topic(log: Arc<dyn EventLog>, topic: impl Into<String>) -> Self {
        Self {
            log,
            topic: topic.into(),
        }
    }

    /// The topic events are appended to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append `event` and return the log's identifier for it.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AppendFailed`] if the log rejects the entry.
    pub async fn submit(&self, event: &Event) -> Result<EntryId, LogError> {
        let id = self.log.append(&self.topic, &event.to_fields()).await?;
        tracing::debug!(
            topic = %self.topic,
            entry_id = %id,
            event_type = %event.event_type,
            "Event submitted"
        );
        Ok(id)
    }
}
