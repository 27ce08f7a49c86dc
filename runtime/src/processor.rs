//! Applies one event's effects to the windowed aggregates.
//!
//! Every event becomes a single [`Pipeline`]:
//!
//! | Condition                          | Commands                                         |
//! |------------------------------------|--------------------------------------------------|
//! | `user_id` present                  | upsert active users                              |
//! | `page_view` with `page_url`        | increment minute bucket, refresh bucket TTL      |
//! | `session_id` present               | upsert sessions                                  |
//! | `session_id` and `user_id` present | upsert the user's session set, refresh its TTL   |
//!
//! The pipeline is submitted once. It is not a cross-key transaction: a
//! failing command may leave the other commands applied, and the whole event
//! is then reported as failed so the consumer leaves it unacknowledged.

use pulse_core::event::ReceivedEvent;
use pulse_core::keys::KeyLayout;
use pulse_core::store::{AggregateStore, Pipeline, ScoreUpdate, StoreError};
use pulse_core::window::{WindowConfig, minute_floor};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while processing an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The aggregate update pipeline failed
    #[error("Aggregate update failed: {0}")]
    Store(#[from] StoreError),
}

/// Applies events to the aggregate store.
#[derive(Clone)]
pub struct EventProcessor {
    store: Arc<dyn AggregateStore>,
    keys: KeyLayout,
    windows: WindowConfig,
    score_update: ScoreUpdate,
}

impl EventProcessor {
    /// Create a processor with the default key layout, windows and
    /// last-write-wins score updates.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self {
            store,
            keys: KeyLayout::default(),
            windows: WindowConfig::default(),
            score_update: ScoreUpdate::default(),
        }
    }

    /// Use a different key layout.
    #[must_use]
    pub fn with_keys(mut self, keys: KeyLayout) -> Self {
        self.keys = keys;
        self
    }

    /// Use different window lengths.
    #[must_use]
    pub const fn with_windows(mut self, windows: WindowConfig) -> Self {
        self.windows = windows;
        self
    }

    /// Choose how upserts treat existing scores.
    #[must_use]
    pub const fn with_score_update(mut self, score_update: ScoreUpdate) -> Self {
        self.score_update = score_update;
        self
    }

    /// Score update mode in effect.
    #[must_use]
    pub const fn score_update(&self) -> ScoreUpdate {
        self.score_update
    }

    /// Build the pipeline for `event` without submitting it.
    ///
    /// An event with no identifiers yields an empty pipeline.
    #[must_use]
    pub fn build_pipeline(&self, event: &ReceivedEvent) -> Pipeline {
        let mut pipeline = Pipeline::new();
        let at = event.timestamp;
        let mode = self.score_update;

        if let Some(user_id) = &event.user_id {
            pipeline = pipeline.upsert(self.keys.active_users(), user_id.as_str(), at, mode);
        }

        if let Some(page_url) = event.page_url.as_deref().filter(|_| event.is_page_view()) {
            let bucket = self.keys.page_views(minute_floor(at));
            pipeline = pipeline
                .increment_field(bucket.as_str(), page_url, 1)
                .expire(bucket, self.windows.page_view_ttl());
        }

        if let Some(session_id) = &event.session_id {
            pipeline = pipeline.upsert(self.keys.sessions(), session_id.as_str(), at, mode);

            if let Some(user_id) = &event.user_id {
                let user_sessions = self.keys.user_sessions(user_id);
                pipeline = pipeline
                    .upsert(user_sessions.as_str(), session_id.as_str(), at, mode)
                    .expire(user_sessions, self.windows.user_session_ttl());
            }
        }

        pipeline
    }

    /// Apply `event` to the aggregates in one round trip.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Store`] if the pipeline fails. The other
    /// commands may already be applied.
    pub async fn process(&self, event: &ReceivedEvent) -> Result<(), ProcessError> {
        let pipeline = self.build_pipeline(event);
        if pipeline.is_empty() {
            tracing::debug!("Event carries no identifiers, nothing to update");
            return Ok(());
        }

        self.store.execute(&pipeline).await?;
        Ok(())
    }
}
