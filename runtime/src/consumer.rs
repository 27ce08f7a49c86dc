//! Stream consumer: pulls batches from the log and feeds the processor.
//!
//! # Delivery
//!
//! Entries are read with "new entries only" semantics for one
//! (group, consumer) pair. Reading advances the group cursor whether or not
//! processing later succeeds, so an entry whose processing fails stays
//! pending for this consumer and is never re-delivered by a plain read. Only
//! successfully processed entries are acknowledged: at-least-once, never
//! at-most-once.
//!
//! Entries stranded in the pending set (a crashed consumer, a failed event)
//! are picked up by the optional reclaim sweep, see [`ReclaimPolicy`].
//!
//! # Shutdown
//!
//! [`StreamConsumer::run`] selects on the shutdown channel only while
//! waiting on the log. A batch that has already been read is processed to
//! completion before the loop exits, so a stop signal never strands half a
//! batch between processing and acknowledgement.

use crate::metrics::{ConsumerMetrics, ProcessingMetrics};
use crate::processor::EventProcessor;
use pulse_core::environment::Clock;
use pulse_core::event::{LogEntry, ReceivedEvent};
use pulse_core::log::{ConsumerRef, EventLog, LogError, StartPosition};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Default log topic.
pub const DEFAULT_TOPIC: &str = "events_stream";
/// Default consumer group.
pub const DEFAULT_GROUP: &str = "analytics_group";
/// Default consumer name.
pub const DEFAULT_CONSUMER: &str = "worker_1";

/// Idle-entry reclaim sweep settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// Minimum time an entry must have been pending before it is claimed
    pub min_idle: Duration,
    /// Time between sweeps
    pub interval: Duration,
    /// Maximum entries claimed per sweep
    pub batch_size: usize,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            min_idle: Duration::from_secs(60),
            interval: Duration::from_secs(30),
            batch_size: 10,
        }
    }
}

/// Stream consumer settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Topic, group and consumer name to read as
    pub consumer: ConsumerRef,
    /// Maximum entries per read
    pub batch_size: usize,
    /// How long a read waits for new entries
    pub block: Duration,
    /// Pause after a failed read
    pub error_backoff: Duration,
    /// Reclaim sweep, disabled when `None`
    pub reclaim: Option<ReclaimPolicy>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer: ConsumerRef::new(DEFAULT_TOPIC, DEFAULT_GROUP, DEFAULT_CONSUMER),
            batch_size: 10,
            block: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
            reclaim: None,
        }
    }
}

impl ConsumerConfig {
    /// Read as `consumer` instead of the default identity.
    #[must_use]
    pub fn with_consumer(mut self, consumer: ConsumerRef) -> Self {
        self.consumer = consumer;
        self
    }

    /// Set the read batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set how long a read waits for new entries.
    #[must_use]
    pub const fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Set the pause after a failed read.
    #[must_use]
    pub const fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    /// Enable the reclaim sweep.
    #[must_use]
    pub const fn with_reclaim(mut self, policy: ReclaimPolicy) -> Self {
        self.reclaim = Some(policy);
        self
    }
}

/// What happened to one batch of entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Entries handed to the consumer
    pub received: usize,
    /// Entries whose aggregate updates succeeded
    pub processed: usize,
    /// Entries whose aggregate updates failed (left pending)
    pub failed: usize,
    /// Entries acknowledged
    pub acknowledged: usize,
}

/// Reads entries from an [`EventLog`] and applies them with an
/// [`EventProcessor`].
pub struct StreamConsumer {
    log: Arc<dyn EventLog>,
    processor: EventProcessor,
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
}

impl StreamConsumer {
    /// Create a consumer.
    ///
    /// `clock` supplies the receive time used when an entry's timestamp is
    /// missing or unparseable.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        processor: EventProcessor,
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            log,
            processor,
            config,
            clock,
        }
    }

    /// The consumer's settings.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Create the consumer group at the log's origin if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the group cannot be created.
    pub async fn ensure_group(&self) -> Result<(), LogError> {
        let consumer = &self.config.consumer;
        self.log
            .create_group(&consumer.topic, &consumer.group, StartPosition::Origin)
            .await?;
        tracing::info!(
            topic = %consumer.topic,
            group = %consumer.group,
            "Consumer group ready"
        );
        Ok(())
    }

    /// Read one batch of new entries and handle it.
    ///
    /// An empty read is not an error and yields an empty outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the read fails. Per-entry failures are
    /// counted in the outcome, not returned.
    pub async fn poll_once(&self) -> Result<BatchOutcome, LogError> {
        let entries = self
            .log
            .read_batch(&self.config.consumer, self.config.batch_size, self.config.block)
            .await?;
        Ok(self.handle_entries(&entries).await)
    }

    /// Claim idle pending entries for this consumer and handle them.
    ///
    /// Does nothing when no [`ReclaimPolicy`] is configured.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the claim fails.
    pub async fn reclaim_once(&self) -> Result<BatchOutcome, LogError> {
        let Some(policy) = self.config.reclaim else {
            return Ok(BatchOutcome::default());
        };

        let consumer = &self.config.consumer;
        let entries = self
            .log
            .claim_idle(consumer, policy.min_idle, policy.batch_size)
            .await?;
        if !entries.is_empty() {
            ConsumerMetrics::record_reclaimed(entries.len());
            tracing::info!(
                topic = %consumer.topic,
                group = %consumer.group,
                consumer = %consumer.consumer,
                count = entries.len(),
                "Reclaimed idle entries"
            );
        }
        Ok(self.handle_entries(&entries).await)
    }

    /// Decode, process and acknowledge `entries` in order.
    ///
    /// An entry is acknowledged only after its aggregate updates succeed.
    /// Failures are logged and counted; they never stop the batch.
    pub async fn handle_entries(&self, entries: &[LogEntry]) -> BatchOutcome {
        let consumer = &self.config.consumer;
        let mut outcome = BatchOutcome::default();

        for entry in entries {
            outcome.received += 1;

            let event = ReceivedEvent::decode(&entry.fields, self.clock.now());
            if event.timestamp_fallback {
                tracing::warn!(
                    entry_id = %entry.id,
                    "Missing or unparseable timestamp, using receive time"
                );
            }

            let started = Instant::now();
            if let Err(e) = self.processor.process(&event).await {
                outcome.failed += 1;
                ProcessingMetrics::record_error(event.event_type_label());
                tracing::error!(
                    entry_id = %entry.id,
                    event_type = event.event_type_label(),
                    error = %e,
                    "Failed to process event, leaving it pending"
                );
                continue;
            }
            outcome.processed += 1;
            ProcessingMetrics::record_success(event.event_type_label(), started.elapsed());

            match self.log.ack(&consumer.topic, &consumer.group, &entry.id).await {
                Ok(()) => {
                    outcome.acknowledged += 1;
                    ConsumerMetrics::record_ack();
                }
                Err(e) => {
                    tracing::error!(
                        entry_id = %entry.id,
                        error = %e,
                        "Failed to acknowledge entry"
                    );
                }
            }
        }

        if outcome.received > 0 {
            tracing::debug!(
                received = outcome.received,
                processed = outcome.processed,
                failed = outcome.failed,
                acknowledged = outcome.acknowledged,
                "Batch handled"
            );
        }
        outcome
    }

    /// Run until a shutdown signal arrives.
    ///
    /// Ensures the consumer group exists (retrying with backoff), then polls
    /// forever. Read failures are logged and followed by a backoff pause;
    /// nothing short of shutdown ends the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let consumer = self.config.consumer.clone();
        tracing::info!(
            topic = %consumer.topic,
            group = %consumer.group,
            consumer = %consumer.consumer,
            batch_size = self.config.batch_size,
            "Starting stream consumer"
        );

        while let Err(e) = self.ensure_group().await {
            tracing::error!(
                topic = %consumer.topic,
                group = %consumer.group,
                error = %e,
                "Failed to create consumer group"
            );
            if self.back_off(&mut shutdown).await {
                tracing::info!("Stream consumer stopped before starting");
                return;
            }
        }

        let mut next_reclaim = self.config.reclaim.map(|_| tokio::time::Instant::now());

        loop {
            if let (Some(due), Some(policy)) = (next_reclaim, self.config.reclaim) {
                if tokio::time::Instant::now() >= due {
                    if let Err(e) = self.reclaim_once().await {
                        tracing::error!(error = %e, "Reclaim sweep failed");
                    }
                    next_reclaim = Some(tokio::time::Instant::now() + policy.interval);
                }
            }

            let read = tokio::select! {
                result = self.log.read_batch(&consumer, self.config.batch_size, self.config.block) => result,
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            };

            match read {
                Ok(entries) if entries.is_empty() => {
                    tracing::trace!("No new entries");
                }
                Ok(entries) => {
                    self.handle_entries(&entries).await;
                }
                Err(e) => {
                    tracing::error!(
                        topic = %consumer.topic,
                        group = %consumer.group,
                        error = %e,
                        "Failed to read from log"
                    );
                    if matches!(e, LogError::ConsumerGroup(_)) {
                        // The group vanished (e.g. the topic was deleted); recreate it.
                        if let Err(e) = self.ensure_group().await {
                            tracing::error!(error = %e, "Failed to recreate consumer group");
                        }
                    }
                    if self.back_off(&mut shutdown).await {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!(consumer = %consumer.consumer, "Stream consumer stopped");
    }

    /// Sleep for the error backoff. Returns `true` if shutdown arrived first.
    async fn back_off(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            () = tokio::time::sleep(self.config.error_backoff) => false,
            _ = shutdown.recv() => true,
        }
    }
}
