//! Integration tests for the Redis backends with a real Redis instance.
//!
//! These tests use testcontainers to start Redis and validate:
//! - Consumer group creation (including the already-exists case)
//! - Read / ack / pending semantics of `XREADGROUP`
//! - Reclaiming idle entries with `XAUTOCLAIM`
//! - Pipeline replies and `ZADD GT` behavior
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker to be running.
//!
//! To run explicitly:
//! ```bash
//! cargo test -p pulse-redis --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages
#![allow(clippy::unwrap_used)]

use pulse_core::event::{Event, Fields};
use pulse_core::log::{ConsumerRef, EventLog, StartPosition};
use pulse_core::store::{
    AggregateStore, Pipeline, ScoreBound, ScoreUpdate, StoreError, StoreReply,
};
use pulse_redis::{RedisAggregateStore, RedisEventLog};
use std::time::Duration;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::redis::{REDIS_PORT, Redis};

const TOPIC: &str = "events_stream";
const GROUP: &str = "analytics_group";
/// `XAUTOCLAIM` and `ZADD ... GT` need Redis 6.2 or later.
const REDIS_TAG: &str = "7.2";

/// Start a Redis container and return it with its connection URL.
///
/// The container must be kept alive for the duration of the test.
async fn setup_redis() -> (ContainerAsync<Redis>, String) {
    let container = Redis::default()
        .with_tag(REDIS_TAG)
        .start()
        .await
        .expect("Failed to start Redis container");
    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get port");
    (container, format!("redis://{host}:{port}"))
}

fn page_view(user: &str) -> Fields {
    let at = chrono::DateTime::parse_from_rfc3339("2024-03-15T14:30:00Z")
        .expect("valid timestamp")
        .with_timezone(&chrono::Utc);
    Event::page_view(user, "s1", "/home", at).to_fields()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn create_group_tolerates_existing_group() {
    let (_container, url) = setup_redis().await;
    let log = RedisEventLog::new(&url).await.expect("connect");

    log.create_group(TOPIC, GROUP, StartPosition::Origin)
        .await
        .expect("first create");
    log.create_group(TOPIC, GROUP, StartPosition::Origin)
        .await
        .expect("second create should be a no-op");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn read_ack_and_empty_read() {
    let (_container, url) = setup_redis().await;
    let log = RedisEventLog::new(&url).await.expect("connect");
    log.create_group(TOPIC, GROUP, StartPosition::Origin)
        .await
        .expect("create group");

    let id = log.append(TOPIC, &page_view("u1")).await.expect("append");

    let consumer = ConsumerRef::new(TOPIC, GROUP, "worker_1");
    let batch = log
        .read_batch(&consumer, 10, Duration::from_millis(100))
        .await
        .expect("read");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, id);
    assert_eq!(batch[0].fields["user_id"], "u1");

    log.ack(TOPIC, GROUP, &id).await.expect("ack");

    // Nothing new: the block interval elapses and the read is empty, not an error.
    let batch = log
        .read_batch(&consumer, 10, Duration::from_millis(100))
        .await
        .expect("empty read");
    assert!(batch.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn idle_entries_are_reclaimed_by_another_consumer() {
    let (_container, url) = setup_redis().await;
    let log = RedisEventLog::new(&url).await.expect("connect");
    log.create_group(TOPIC, GROUP, StartPosition::Origin)
        .await
        .expect("create group");
    let id = log.append(TOPIC, &page_view("u1")).await.expect("append");

    let crashed = ConsumerRef::new(TOPIC, GROUP, "worker_1");
    log.read_batch(&crashed, 10, Duration::ZERO)
        .await
        .expect("read");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let rescuer = ConsumerRef::new(TOPIC, GROUP, "worker_2");
    let claimed = log
        .claim_idle(&rescuer, Duration::from_millis(100), 10)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn pipeline_replies_follow_submission_order() {
    let (_container, url) = setup_redis().await;
    let store = RedisAggregateStore::new(&url).await.expect("connect");

    let pipeline = Pipeline::new()
        .upsert("analytics:active_users", "u1", 200.0, ScoreUpdate::GreaterWins)
        .upsert("analytics:active_users", "u1", 100.0, ScoreUpdate::GreaterWins)
        .increment_field("analytics:views:60", "/home", 1)
        .increment_field("analytics:views:60", "/home", 1)
        .expire("analytics:views:60", Duration::from_secs(60))
        .range_by_score("analytics:active_users", ScoreBound::Inclusive(150.0), ScoreBound::PosInf)
        .get_hash("analytics:views:60");

    let replies = store.execute(&pipeline).await.expect("execute");
    assert_eq!(
        replies,
        vec![
            StoreReply::Integer(1),
            StoreReply::Integer(0),
            StoreReply::Integer(1),
            StoreReply::Integer(2),
            StoreReply::Integer(1),
            StoreReply::Members(vec!["u1".to_string()]),
            StoreReply::Fields(vec![("/home".to_string(), "2".to_string())]),
        ]
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn wrong_type_fails_one_command_and_applies_the_others() {
    let (_container, url) = setup_redis().await;
    let store = RedisAggregateStore::new(&url).await.expect("connect");

    store
        .execute(&Pipeline::new().increment_field("collision", "f", 1))
        .await
        .expect("seed hash");

    let pipeline = Pipeline::new()
        .upsert("analytics:sessions", "s1", 1.0, ScoreUpdate::Overwrite)
        .upsert("collision", "u1", 1.0, ScoreUpdate::Overwrite)
        .upsert("analytics:active_users", "u1", 1.0, ScoreUpdate::Overwrite);
    assert!(matches!(
        store.execute(&pipeline).await,
        Err(StoreError::Rejected(_))
    ));

    // EXEC runs the commands on both sides of the failing one.
    let replies = store
        .execute(
            &Pipeline::new()
                .cardinality("analytics:sessions")
                .cardinality("analytics:active_users"),
        )
        .await
        .expect("cardinality");
    assert_eq!(replies, vec![StoreReply::Integer(1), StoreReply::Integer(1)]);
}
