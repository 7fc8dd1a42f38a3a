//! Upstream changes flowing into refresh requests and a live change feed.
//!
//! Run with `RUST_LOG=info cargo run --example change-ingestion`.

use courier::prelude::*;
use courier_mem::{
    ChannelConnection, InMemoryBroker, InMemoryChangeStore, RecordingAnnouncer, StaticNameLookup,
    TtlCache,
};
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let broker = InMemoryBroker::new();
    let mut queues = QueueSet::new(Arc::new(broker.clone()), PipelineConfig::default());
    let channels = queues.channels();

    let hub = Arc::new(Hub::new());
    let (connection, mut feed) = ChannelConnection::pair();
    hub.subscribe(Topic::Changes, connection);

    let store = InMemoryChangeStore::new();
    let announcer = RecordingAnnouncer::new();
    let names = StaticNameLookup::new()
        .with_name(EntityKind::App, 440, "Team Fortress 2")
        .with_name(EntityKind::App, 570, "Dota 2");
    let producer = Producer::new(
        channels.clone(),
        DedupGuard::new(Arc::new(TtlCache::new()), DedupConfig::default()),
    );
    let changes = ChangesHandler::new(
        Arc::new(store.clone()),
        Arc::new(names),
        producer,
        Notifier::Local(hub),
    )
    .with_announcer(Arc::new(announcer.clone()));

    // Refreshes are only produced here; another process consumes them
    queues
        .declare(QueueDefinition::both(QueueName::Changes, Arc::new(changes)))?
        .declare(QueueDefinition::producer(QueueName::App))?
        .declare(QueueDefinition::producer(QueueName::Package))?;
    queues.start().await;

    let batch = ChangesMessage {
        apps: BTreeMap::from([(440, 9001), (570, 9001)]),
        packages: BTreeMap::from([(1, 9002)]),
    };
    channels
        .produce(QueueName::Changes, Payload::Changes(batch))
        .await?;

    match tokio::time::timeout(Duration::from_secs(5), feed.recv()).await {
        Ok(Some(frame)) => info!("Change feed: {}", frame),
        _ => log::warn!("Nothing arrived on the change feed"),
    }
    queues.shutdown().await;

    for record in store.records().await {
        info!(
            "Change {} touched {:?}",
            record.transaction_id, record.entity_ids
        );
    }
    info!(
        "{} refresh(es) queued for apps, {} for packages, {} announcement(s)",
        broker.queue_len(QueueName::App).await,
        broker.queue_len(QueueName::Package).await,
        announcer.announced().await.len()
    );
    Ok(())
}
