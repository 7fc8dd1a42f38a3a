//! Integration tests for deduplicated refresh requests.

mod common;

use common::*;
use courier_core::dedup::guard_key;
use courier_core::prelude::*;
use courier_mem::{InMemoryBroker, TtlCache};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    broker: InMemoryBroker,
    cache: TtlCache,
    producer: Producer,
}

fn harness() -> Harness {
    init_logger();
    let broker = InMemoryBroker::new();
    let cache = TtlCache::new();
    let mut queues = QueueSet::new(Arc::new(broker.clone()), test_config());
    queues
        .declare(QueueDefinition::producer(QueueName::App))
        .unwrap()
        .declare(QueueDefinition::producer(QueueName::Player))
        .unwrap();
    let producer = Producer::new(
        queues.channels(),
        DedupGuard::new(Arc::new(cache.clone()), DedupConfig::default()),
    );
    Harness {
        broker,
        cache,
        producer,
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_requests_are_deduplicated_until_the_guard_expires() {
    let h = harness();

    let first = h.producer.produce(EntityKind::App, 440).await.unwrap();
    let second = h.producer.produce(EntityKind::App, 440).await.unwrap();
    let other = h.producer.produce(EntityKind::App, 570).await.unwrap();

    assert_eq!(first, ProduceOutcome::Enqueued);
    assert_eq!(second, ProduceOutcome::AlreadyQueued);
    assert_eq!(other, ProduceOutcome::Enqueued);
    assert_eq!(h.broker.queue_len(QueueName::App).await, 2);

    tokio::time::advance(Duration::from_secs(61)).await;

    let after_expiry = h.producer.produce(EntityKind::App, 440).await.unwrap();
    assert_eq!(after_expiry, ProduceOutcome::Enqueued);
    assert_eq!(h.broker.queue_len(QueueName::App).await, 3);
}

#[tokio::test(start_paused = true)]
async fn player_guards_last_longer() {
    let h = harness();
    let id = 76_561_197_960_287_930;

    h.producer.produce(EntityKind::Player, id).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    let outcome = h.producer.produce(EntityKind::Player, id).await.unwrap();
    assert_eq!(outcome, ProduceOutcome::AlreadyQueued);
}

#[tokio::test]
async fn forced_requests_are_marked_as_forced() {
    let h = harness();

    h.producer.produce_forced(EntityKind::App, 440).await.unwrap();

    let queued = h.broker.peek(QueueName::App).await;
    assert_eq!(queued[0]["message"]["id"], 440);
    assert_eq!(queued[0]["message"]["force"], true);
}

#[tokio::test]
async fn a_failing_guard_does_not_block_requests() {
    let h = harness();
    h.cache
        .faults()
        .push_times(CollaboratorError::transient("cache down"), 2);

    let first = h.producer.produce(EntityKind::App, 440).await.unwrap();
    let second = h.producer.produce(EntityKind::App, 440).await.unwrap();

    assert_eq!(first, ProduceOutcome::Enqueued);
    assert_eq!(second, ProduceOutcome::Enqueued);
    assert_eq!(h.broker.queue_len(QueueName::App).await, 2);
}

#[tokio::test]
async fn a_failed_publish_releases_the_guard() {
    let h = harness();
    h.broker.set_publish_failing(QueueName::App, true);

    let failed = h.producer.produce(EntityKind::App, 440).await;
    assert!(matches!(failed, Err(ProduceError::Queue(_))));
    assert!(!h.cache.contains(&guard_key(EntityKind::App, 440)).await);

    h.broker.set_publish_failing(QueueName::App, false);
    let retried = h.producer.produce(EntityKind::App, 440).await.unwrap();
    assert_eq!(retried, ProduceOutcome::Enqueued);
}

#[tokio::test]
async fn change_driven_refreshes_bypass_the_guard_and_set_it() {
    let h = harness();

    h.producer.produce(EntityKind::App, 440).await.unwrap();
    h.producer
        .produce_change(EntityKind::App, 440, 9001)
        .await
        .unwrap();
    assert_eq!(h.broker.queue_len(QueueName::App).await, 2);
    let queued = h.broker.peek(QueueName::App).await;
    assert_eq!(queued[1]["message"]["change_number"], 9001);

    h.producer
        .produce_change(EntityKind::App, 570, 9002)
        .await
        .unwrap();
    let outcome = h.producer.produce(EntityKind::App, 570).await.unwrap();
    assert_eq!(outcome, ProduceOutcome::AlreadyQueued);
}

#[tokio::test]
async fn invalid_ids_are_rejected_before_touching_the_guard() {
    let h = harness();

    let result = h.producer.produce(EntityKind::Player, 42).await;

    assert!(matches!(result, Err(ProduceError::Validation(_))));
    assert!(!h.cache.contains(&guard_key(EntityKind::Player, 42)).await);
    assert_eq!(h.broker.queue_len(QueueName::Player).await, 0);
}

#[tokio::test]
async fn undeclared_queues_surface_as_queue_errors() {
    let h = harness();

    let result = h.producer.produce(EntityKind::Group, 103_582_791).await;

    assert!(matches!(
        result,
        Err(ProduceError::Queue(QueueError::ChannelNotFound(QueueName::Group)))
    ));
}
