//! Integration tests for the worker lifecycle.

#![allow(clippy::unwrap_used)]

use pulse_core::environment::Clock;
use pulse_core::event::Event;
use pulse_runtime::{
    ConsumerConfig, EventProcessor, EventPublisher, Pruner, PrunerConfig, StreamConsumer,
    TaskExit, Worker,
};
use pulse_testing::{InMemoryAggregateStore, InMemoryEventLog, RecordingGaugeSink, test_clock};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn worker_runs_both_loops_and_stops_cleanly() {
    let clock = Arc::new(test_clock());
    let log = InMemoryEventLog::new(clock.clone());
    let store = InMemoryAggregateStore::new(clock.clone());
    let sink = RecordingGaugeSink::new();

    let publisher = EventPublisher::new(Arc::new(log.clone()));
    publisher
        .submit(&Event::page_view("u1", "s1", "/home", clock.now()))
        .await
        .unwrap();

    // The consumer blocks far longer than the test runs; shutdown must cut
    // the wait short.
    let consumer = StreamConsumer::new(
        Arc::new(log.clone()),
        EventProcessor::new(Arc::new(store.clone())),
        ConsumerConfig::default().with_block(Duration::from_secs(30)),
        clock.clone(),
    );
    let pruner = Pruner::new(Arc::new(store.clone()), clock, Arc::new(sink.clone()))
        .with_config(PrunerConfig {
            interval: Duration::from_millis(10),
        });

    let report = Worker::new(consumer, pruner)
        .with_shutdown_timeout(Duration::from_secs(2))
        .run(tokio::time::sleep(Duration::from_millis(200)))
        .await;

    assert!(report.is_clean());
    assert_eq!(report.consumer, TaskExit::Stopped);
    assert_eq!(store.members("analytics:active_users"), vec!["u1"]);
    assert!(sink.published().len() >= 2);
    assert_eq!(sink.last().unwrap().active_users, 1);
}
