//! A single process running the whole refresh path on in-memory backends.
//!
//! Run with `RUST_LOG=debug cargo run --example refresh-pipeline`.

use courier::prelude::*;
use courier_mem::{
    ChannelConnection, InMemoryBroker, InMemoryDocumentStore, InMemorySearchIndex,
    InMemoryTimeSeries, ScriptedUpstream, TtlCache,
};
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let upstream = ScriptedUpstream::new();
    upstream
        .insert(
            EntityKind::App,
            440,
            UpstreamEntity {
                name: "Team Fortress 2".to_string(),
                change_number: Some(9001),
                fields: serde_json::json!({"type": "game"}),
                metrics: [("players".to_string(), 61_000.0)].into_iter().collect(),
            },
        )
        .await;
    // The first fetch times out, so the refresh takes one trip through the delay queue
    upstream
        .faults()
        .push(CollaboratorError::transient("upstream timed out"));

    let documents = InMemoryDocumentStore::new();
    let cache = TtlCache::new();
    let collaborators = Collaborators {
        upstream: Arc::new(upstream),
        documents: Arc::new(documents.clone()),
        search: Arc::new(InMemorySearchIndex::new()),
        time_series: Arc::new(InMemoryTimeSeries::new()),
        cache: Arc::new(cache.clone()),
    };

    let config = PipelineConfig {
        retry_policies: RetryPolicies::new(RetryPolicy {
            backoff: Backoff::Linear {
                step: Duration::from_millis(200),
            },
            ..RetryPolicy::default()
        }),
        on_dead_letter: Some(Arc::new(|info: &DeadLetterInfo| {
            log::error!("Dead letter from '{}': {}", info.queue, info.error_message);
        })),
        ..PipelineConfig::from_env()?
    };

    let hub = Arc::new(Hub::new());
    let (connection, mut frames) = ChannelConnection::pair();
    hub.subscribe(Topic::App, connection);

    let mut queues = QueueSet::new(Arc::new(InMemoryBroker::new()), config.clone());
    let channels = queues.channels();
    let refresh = RefreshHandler::new(
        EntityKind::App,
        collaborators,
        Notifier::Queue(channels.clone()),
    );
    let delay = DelayHandler::new(
        config.retry_policies.clone(),
        channels.clone(),
        config.delay_throttle,
    );
    queues
        .declare(QueueDefinition::both(QueueName::App, Arc::new(refresh)).batch_size(10))?
        .declare(QueueDefinition::consumer(QueueName::Delay, Arc::new(delay)))?
        .declare(QueueDefinition::both(
            QueueName::Websockets,
            Arc::new(FanoutHandler::new(hub.clone())),
        ))?;
    queues.start().await;

    let producer = Producer::new(
        channels,
        DedupGuard::new(Arc::new(cache), DedupConfig::default()),
    );
    for _ in 0..3 {
        let outcome = producer.produce(EntityKind::App, 440).await?;
        info!("Requested a refresh of app 440: {:?}", outcome);
    }

    match tokio::time::timeout(Duration::from_secs(10), frames.recv()).await {
        Ok(Some(frame)) => info!("Subscriber received {}", frame),
        _ => log::warn!("No notification arrived"),
    }
    if let Some(document) = documents.document(EntityKind::App, 440).await {
        info!(
            "Stored '{}' at change {:?}",
            document.name, document.change_number
        );
    }

    queues.shutdown().await;
    Ok(())
}
