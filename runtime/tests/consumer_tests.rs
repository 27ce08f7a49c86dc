//! Integration tests for the stream consumer over the in-memory log and
//! store: acknowledgement rules, redelivery, reclaim and the run loop.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)] // Polling helpers fail the test by panicking

use pulse_core::environment::{Clock, epoch_seconds};
use pulse_core::event::{Event, Fields, field};
use pulse_core::log::EventLog;
use pulse_runtime::consumer::{DEFAULT_GROUP, DEFAULT_TOPIC};
use pulse_runtime::{
    BatchOutcome, ConsumerConfig, EventProcessor, EventPublisher, ReclaimPolicy, StreamConsumer,
};
use pulse_testing::{InMemoryAggregateStore, InMemoryEventLog, ManualClock, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    clock: ManualClock,
    log: InMemoryEventLog,
    store: InMemoryAggregateStore,
    publisher: EventPublisher,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::from(test_clock());
        let log = InMemoryEventLog::new(Arc::new(clock.clone()));
        let store = InMemoryAggregateStore::new(Arc::new(clock.clone()));
        Self {
            publisher: EventPublisher::new(Arc::new(log.clone())),
            clock,
            log,
            store,
        }
    }

    fn consumer(&self, config: ConsumerConfig) -> StreamConsumer {
        StreamConsumer::new(
            Arc::new(self.log.clone()),
            EventProcessor::new(Arc::new(self.store.clone())),
            config,
            Arc::new(self.clock.clone()),
        )
    }

    fn event(&self, user: &str) -> Event {
        Event::page_view(user, format!("{user}-session"), "/home", self.clock.now())
    }

    async fn wait_for_user(&self, user: &str) {
        for _ in 0..200 {
            if self
                .store
                .members("analytics:active_users")
                .iter()
                .any(|member| member == user)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{user} was never processed");
    }
}

fn non_blocking() -> ConsumerConfig {
    ConsumerConfig::default().with_block(Duration::ZERO)
}

#[tokio::test]
async fn empty_read_does_not_raise() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking());
    consumer.ensure_group().await.unwrap();

    assert_eq!(consumer.poll_once().await.unwrap(), BatchOutcome::default());
    assert_eq!(consumer.poll_once().await.unwrap(), BatchOutcome::default());
}

#[tokio::test]
async fn group_is_created_at_the_origin() {
    let h = Harness::new();
    h.publisher.submit(&h.event("early")).await.unwrap();

    let consumer = h.consumer(non_blocking());
    consumer.ensure_group().await.unwrap();
    consumer.ensure_group().await.unwrap();

    let outcome = consumer.poll_once().await.unwrap();
    assert_eq!(outcome.acknowledged, 1);
    assert_eq!(h.store.members("analytics:active_users"), vec!["early"]);
}

#[tokio::test]
async fn batches_are_bounded_by_batch_size() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking().with_batch_size(2));
    consumer.ensure_group().await.unwrap();
    for user in ["u1", "u2", "u3"] {
        h.publisher.submit(&h.event(user)).await.unwrap();
    }

    assert_eq!(consumer.poll_once().await.unwrap().received, 2);
    assert_eq!(consumer.poll_once().await.unwrap().received, 1);
}

#[tokio::test]
async fn failed_event_stays_pending_and_is_not_redelivered() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking());
    consumer.ensure_group().await.unwrap();
    let id = h.publisher.submit(&h.event("u1")).await.unwrap();

    h.store.fail_next_round_trip("connection reset");
    let outcome = consumer.poll_once().await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome {
            received: 1,
            processed: 0,
            failed: 1,
            acknowledged: 0,
        }
    );
    assert_eq!(h.log.pending(DEFAULT_TOPIC, DEFAULT_GROUP), vec![id]);
    assert!(h.store.members("analytics:active_users").is_empty());

    // "New entries only": the pending entry is not handed out again.
    assert_eq!(consumer.poll_once().await.unwrap(), BatchOutcome::default());
}

#[tokio::test]
async fn one_failure_does_not_stop_the_batch() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking());
    consumer.ensure_group().await.unwrap();
    let failed = h.publisher.submit(&h.event("u1")).await.unwrap();
    h.publisher.submit(&h.event("u2")).await.unwrap();

    h.store.fail_next_round_trip("timeout");
    let outcome = consumer.poll_once().await.unwrap();

    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.acknowledged, 1);
    assert_eq!(h.log.pending(DEFAULT_TOPIC, DEFAULT_GROUP), vec![failed]);
    assert_eq!(h.store.members("analytics:active_users"), vec!["u2"]);
}

#[tokio::test]
async fn ack_failure_leaves_applied_event_pending() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking());
    consumer.ensure_group().await.unwrap();
    let id = h.publisher.submit(&h.event("u1")).await.unwrap();

    h.log.fail_next_ack("connection reset");
    let outcome = consumer.poll_once().await.unwrap();

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.acknowledged, 0);
    assert_eq!(h.store.members("analytics:active_users"), vec!["u1"]);
    assert_eq!(h.log.pending(DEFAULT_TOPIC, DEFAULT_GROUP), vec![id]);
}

#[tokio::test]
async fn read_failure_is_returned() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking());
    consumer.ensure_group().await.unwrap();

    h.log.fail_next_read("connection refused");
    assert!(consumer.poll_once().await.is_err());
    assert_eq!(consumer.poll_once().await.unwrap(), BatchOutcome::default());
}

#[tokio::test]
async fn missing_timestamp_uses_receive_time() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking());
    consumer.ensure_group().await.unwrap();

    let fields = Fields::from([
        (field::USER_ID.to_string(), "u1".to_string()),
        (field::TIMESTAMP.to_string(), "not a timestamp".to_string()),
    ]);
    h.log.append(DEFAULT_TOPIC, &fields).await.unwrap();

    let outcome = consumer.poll_once().await.unwrap();
    assert_eq!(outcome.acknowledged, 1);
    assert_eq!(
        h.store.score("analytics:active_users", "u1"),
        Some(epoch_seconds(h.clock.now()))
    );
}

#[tokio::test]
async fn reclaim_recovers_entries_left_by_a_crashed_consumer() {
    let h = Harness::new();
    let crashed = h.consumer(non_blocking());
    crashed.ensure_group().await.unwrap();
    let id = h.publisher.submit(&h.event("u1")).await.unwrap();

    h.store.fail_next_round_trip("connection reset");
    crashed.poll_once().await.unwrap();

    let policy = ReclaimPolicy {
        min_idle: Duration::from_secs(30),
        interval: Duration::from_secs(10),
        batch_size: 10,
    };
    let mut config = non_blocking().with_reclaim(policy);
    config.consumer.consumer = "worker_2".to_string();
    let rescuer = h.consumer(config);

    assert_eq!(h.log.delivery_count(DEFAULT_TOPIC, DEFAULT_GROUP, &id), 1);

    // Not idle long enough yet.
    assert_eq!(rescuer.reclaim_once().await.unwrap(), BatchOutcome::default());

    h.clock.advance(Duration::from_secs(31));
    let outcome = rescuer.reclaim_once().await.unwrap();

    assert_eq!(outcome.received, 1);
    assert_eq!(outcome.acknowledged, 1);
    assert!(h.log.pending(DEFAULT_TOPIC, DEFAULT_GROUP).is_empty());
    assert_eq!(h.store.members("analytics:active_users"), vec!["u1"]);
}

#[tokio::test]
async fn redelivered_page_view_is_counted_again() {
    let h = Harness::new();
    let consumer = h.consumer(non_blocking().with_reclaim(ReclaimPolicy {
        min_idle: Duration::from_secs(1),
        ..ReclaimPolicy::default()
    }));
    consumer.ensure_group().await.unwrap();
    h.publisher.submit(&h.event("u1")).await.unwrap();

    // The aggregates are written but the ack is lost.
    h.log.fail_next_ack("connection reset");
    consumer.poll_once().await.unwrap();

    h.clock.advance(Duration::from_secs(2));
    assert_eq!(consumer.reclaim_once().await.unwrap().acknowledged, 1);

    let bucket = format!(
        "analytics:views:{}",
        pulse_core::window::minute_floor(epoch_seconds(test_clock().now()))
    );
    assert_eq!(h.store.hash_field(&bucket, "/home"), Some(2));
    assert_eq!(h.store.members("analytics:active_users"), vec!["u1"]);
}

#[tokio::test]
async fn run_processes_entries_until_shutdown() {
    let h = Harness::new();
    let consumer = h.consumer(ConsumerConfig::default().with_block(Duration::from_millis(50)));
    h.publisher.submit(&h.event("before_start")).await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    h.wait_for_user("before_start").await;
    h.publisher.submit(&h.event("while_running")).await.unwrap();
    h.wait_for_user("while_running").await;

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(h.log.pending(DEFAULT_TOPIC, DEFAULT_GROUP).is_empty());
}

#[tokio::test]
async fn run_survives_read_failures() {
    let h = Harness::new();
    let consumer = h.consumer(
        ConsumerConfig::default()
            .with_block(Duration::from_millis(20))
            .with_error_backoff(Duration::from_millis(10)),
    );
    h.log.fail_next_read("connection refused");
    h.log.fail_next_read("connection refused");
    h.publisher.submit(&h.event("u1")).await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    h.wait_for_user("u1").await;

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn run_reclaims_on_start() {
    let h = Harness::new();
    let crashed = h.consumer(non_blocking());
    crashed.ensure_group().await.unwrap();
    h.publisher.submit(&h.event("stranded")).await.unwrap();
    h.store.fail_next_round_trip("connection reset");
    crashed.poll_once().await.unwrap();
    h.clock.advance(Duration::from_secs(120));

    let mut config = ConsumerConfig::default()
        .with_block(Duration::from_millis(20))
        .with_reclaim(ReclaimPolicy::default());
    config.consumer.consumer = "worker_2".to_string();
    let rescuer = h.consumer(config);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(rescuer.run(shutdown_rx));

    h.wait_for_user("stranded").await;

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(h.log.pending(DEFAULT_TOPIC, DEFAULT_GROUP).is_empty());
}
