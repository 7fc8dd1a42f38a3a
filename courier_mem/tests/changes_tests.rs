//! Integration tests for change ingestion.

mod common;

use common::*;
use courier_core::prelude::*;
use courier_mem::{
    ChannelConnection, InMemoryBroker, InMemoryChangeStore, RecordingAnnouncer, StaticNameLookup,
    TtlCache,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    broker: InMemoryBroker,
    store: InMemoryChangeStore,
    announcer: RecordingAnnouncer,
    frames: UnboundedReceiver<String>,
    handler: ChangesHandler,
}

fn harness(producible: &[QueueName]) -> Harness {
    init_logger();
    let broker = InMemoryBroker::new();
    let mut queues = QueueSet::new(Arc::new(broker.clone()), test_config());
    for queue in producible {
        queues
            .declare(QueueDefinition::producer(*queue))
            .unwrap();
    }
    let producer = Producer::new(
        queues.channels(),
        DedupGuard::new(Arc::new(TtlCache::new()), DedupConfig::default()),
    );

    let hub = Arc::new(Hub::new());
    let (connection, frames) = ChannelConnection::pair();
    hub.subscribe(Topic::Changes, connection);

    let store = InMemoryChangeStore::new();
    let announcer = RecordingAnnouncer::new();
    let names = StaticNameLookup::new()
        .with_name(EntityKind::App, 440, "Team Fortress 2")
        .with_name(EntityKind::Package, 1, "Valve Complete Pack");
    let handler = ChangesHandler::new(
        Arc::new(store.clone()),
        Arc::new(names),
        producer,
        Notifier::Local(hub),
    )
    .with_announcer(Arc::new(announcer.clone()));

    Harness {
        broker,
        store,
        announcer,
        frames,
        handler,
    }
}

fn changes() -> Payload {
    Payload::Changes(ChangesMessage {
        apps: BTreeMap::from([(440, 9001), (570, 9001)]),
        packages: BTreeMap::from([(1, 9002)]),
    })
}

async fn handle(handler: &ChangesHandler, payload: Payload) -> Option<Decision> {
    let delivery = delivery(QueueName::Changes, payload);
    handler.handle(std::slice::from_ref(&delivery)).await;
    delivery.decision()
}

#[tokio::test]
async fn changes_are_persisted_refreshed_and_broadcast() {
    let mut h = harness(&[QueueName::App, QueueName::Package]);

    let decision = handle(&h.handler, changes()).await;

    assert_eq!(decision, Some(Decision::Ack));

    let records = h.store.records().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].transaction_id, 9001);
    assert_eq!(records[0].entity_ids[&EntityKind::App], vec![440, 570]);
    assert_eq!(records[1].transaction_id, 9002);
    assert_eq!(records[1].entity_ids[&EntityKind::Package], vec![1]);

    let apps = h.broker.peek(QueueName::App).await;
    let refreshed: Vec<(Value, Value)> = apps
        .iter()
        .map(|e| (e["message"]["id"].clone(), e["message"]["change_number"].clone()))
        .collect();
    assert_eq!(
        refreshed,
        vec![(json!(440), json!(9001)), (json!(570), json!(9001))]
    );
    let packages = h.broker.peek(QueueName::Package).await;
    assert_eq!(packages[0]["message"], json!({"id": 1, "change_number": 9002}));

    let frame: Value = serde_json::from_str(&h.frames.try_recv().unwrap()).unwrap();
    let rows = frame["batch"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], json!(9001));
    assert_eq!(
        rows[0][2],
        json!({"app": [[440, "Team Fortress 2"], [570, null]]})
    );
    assert_eq!(
        rows[1][2],
        json!({"package": [[1, "Valve Complete Pack"]]})
    );

    assert_eq!(h.announcer.announced().await.len(), 2);
}

#[tokio::test]
async fn redelivered_changes_are_not_announced_twice() {
    let h = harness(&[QueueName::App, QueueName::Package]);

    handle(&h.handler, changes()).await;
    let decision = handle(&h.handler, changes()).await;

    assert_eq!(decision, Some(Decision::Ack));
    assert_eq!(h.store.records().await.len(), 2);
    assert_eq!(h.announcer.announced().await.len(), 2);
    assert_eq!(h.broker.queue_len(QueueName::App).await, 4);
}

#[tokio::test]
async fn empty_batches_are_acked_without_side_effects() {
    let mut h = harness(&[QueueName::App, QueueName::Package]);

    let decision = handle(&h.handler, Payload::Changes(ChangesMessage::default())).await;

    assert_eq!(decision, Some(Decision::Ack));
    assert!(h.store.records().await.is_empty());
    assert!(h.frames.try_recv().is_err());
}

#[tokio::test]
async fn store_outages_are_retried() {
    let h = harness(&[QueueName::App, QueueName::Package]);
    h.store
        .faults()
        .push(CollaboratorError::transient("connection refused"));

    let decision = handle(&h.handler, changes()).await;

    assert!(matches!(decision, Some(Decision::Retry { .. })));
    assert!(h.store.records().await.is_empty());
    assert!(h.announcer.announced().await.is_empty());
}

#[tokio::test]
async fn rejected_records_fail() {
    let h = harness(&[QueueName::App, QueueName::Package]);
    h.store
        .faults()
        .push(CollaboratorError::validation("transaction id out of range"));

    let decision = handle(&h.handler, changes()).await;

    assert!(matches!(decision, Some(Decision::Fail { .. })));
}

#[tokio::test]
async fn unroutable_refreshes_retry_the_whole_batch() {
    let mut h = harness(&[QueueName::App]);

    let decision = handle(&h.handler, changes()).await;

    assert!(matches!(decision, Some(Decision::Retry { .. })));
    assert!(h.store.records().await.is_empty());
    assert!(h.frames.try_recv().is_err());
    assert!(h.announcer.announced().await.is_empty());
}

#[tokio::test]
async fn batches_retried_after_a_failed_enqueue_are_still_announced() {
    let mut h = harness(&[QueueName::App, QueueName::Package]);
    h.broker.set_publish_failing(QueueName::Package, true);

    let first = handle(&h.handler, changes()).await;
    assert!(matches!(first, Some(Decision::Retry { .. })));
    assert!(h.store.records().await.is_empty());
    assert!(h.announcer.announced().await.is_empty());

    h.broker.set_publish_failing(QueueName::Package, false);
    let second = handle(&h.handler, changes()).await;

    assert_eq!(second, Some(Decision::Ack));
    assert_eq!(h.store.records().await.len(), 2);
    let announced: Vec<u64> = h
        .announcer
        .announced()
        .await
        .iter()
        .map(|r| r.transaction_id)
        .collect();
    assert_eq!(announced, vec![9001, 9002]);
    assert!(h.frames.try_recv().is_ok());
}

#[tokio::test]
async fn invalid_entity_ids_are_skipped() {
    let h = harness(&[QueueName::App, QueueName::Package]);
    let message = Payload::Changes(ChangesMessage {
        apps: BTreeMap::from([(440, 9001), (1 << 40, 9001)]),
        packages: BTreeMap::new(),
    });

    let decision = handle(&h.handler, message).await;

    assert_eq!(decision, Some(Decision::Ack));
    assert_eq!(h.broker.queue_len(QueueName::App).await, 1);
}

#[tokio::test]
async fn other_payloads_fail() {
    let h = harness(&[QueueName::App, QueueName::Package]);

    let decision = handle(&h.handler, Payload::App(EntityMessage::new(440))).await;

    assert!(matches!(decision, Some(Decision::Fail { .. })));
}
