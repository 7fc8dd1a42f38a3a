#![allow(dead_code)]

use async_trait::async_trait;
use courier_core::prelude::*;
use courier_mem::*;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short waits so consumers react quickly and shut down fast.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        fetch_wait: Duration::from_millis(20),
        delay_throttle: Duration::from_millis(1),
        fetch_error_backoff: Duration::from_millis(10),
        max_fetch_error_backoff: Duration::from_millis(50),
        retry_policies: RetryPolicies::new(RetryPolicy {
            max_attempts: 3,
            max_age: Duration::from_secs(3600),
            backoff: Backoff::Linear {
                step: Duration::ZERO,
            },
        }),
        on_dead_letter: None,
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// A delivery of a freshly produced payload, as a handler would see it.
pub fn delivery(queue: QueueName, payload: Payload) -> Delivery {
    Delivery::new(Envelope::new(payload, queue), queue, 1)
}

type Script = Box<dyn Fn(&Delivery) + Send + Sync>;

/// A handler that records the attempt of every delivery and decides through a script.
#[derive(HandlerName)]
pub struct ScriptedHandler {
    script: Script,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedHandler {
    pub fn new(script: impl Fn(&Delivery) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn acking() -> Arc<Self> {
        Self::new(|delivery| {
            delivery.ack();
        })
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(&self, batch: &[Delivery]) {
        for delivery in batch {
            self.attempts
                .lock()
                .unwrap()
                .push(delivery.envelope().attempt);
            (self.script)(delivery);
        }
    }
}

/// Collects dead letters handed to the callback.
#[derive(Clone, Default)]
pub struct DeadLetters(Arc<Mutex<Vec<DeadLetterInfo>>>);

impl DeadLetters {
    pub fn callback(&self) -> Arc<dyn DeadLetterCallback> {
        let seen = self.0.clone();
        Arc::new(move |info: &DeadLetterInfo| seen.lock().unwrap().push(info.clone()))
    }

    pub fn all(&self) -> Vec<DeadLetterInfo> {
        self.0.lock().unwrap().clone()
    }
}

/// Every fake collaborator a refresh touches.
#[derive(Clone, Default)]
pub struct Fakes {
    pub upstream: ScriptedUpstream,
    pub documents: InMemoryDocumentStore,
    pub search: InMemorySearchIndex,
    pub time_series: InMemoryTimeSeries,
    pub cache: TtlCache,
}

impl Fakes {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            upstream: Arc::new(self.upstream.clone()),
            documents: Arc::new(self.documents.clone()),
            search: Arc::new(self.search.clone()),
            time_series: Arc::new(self.time_series.clone()),
            cache: Arc::new(self.cache.clone()),
        }
    }
}

pub fn upstream_entity(name: &str, change_number: Option<u64>) -> UpstreamEntity {
    UpstreamEntity {
        name: name.to_string(),
        change_number,
        fields: serde_json::json!({"type": "game"}),
        metrics: [("players".to_string(), 1200.0)].into_iter().collect(),
    }
}
