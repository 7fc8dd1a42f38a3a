//! Queue declarations for one process, production, and the consumer tasks.
//!
//! ```ignore
//! let mut queues = QueueSet::new(broker.clone(), PipelineConfig::default());
//! let channels = queues.channels();
//! queues.declare(QueueDefinition::producer(QueueName::App))?;
//! queues.declare(QueueDefinition::consumer(QueueName::Delay, Arc::new(delay_handler)))?;
//! queues.start().await;
//!
//! channels.produce(QueueName::App, Payload::App(EntityMessage::new(440))).await?;
//! ```

use crate::broker::Broker;
use crate::config::PipelineConfig;
use crate::envelope::Envelope;
use crate::error::QueueError;
use crate::payload::Payload;
use crate::queue::{QueueDefinition, QueueName};
use crate::worker::Worker;
use log::{error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Producer handle onto the queues declared by this process.
///
/// Cheap to clone. Clones observe declarations made after they were taken.
#[derive(Clone)]
pub struct Channels {
    broker: Arc<dyn Broker>,
    producers: Arc<RwLock<HashSet<QueueName>>>,
}

impl Channels {
    /// Wraps `payload` in a fresh envelope and publishes it on `queue`.
    pub async fn produce(&self, queue: QueueName, payload: Payload) -> Result<(), QueueError> {
        if !self.is_declared(queue) {
            return Err(QueueError::ChannelNotFound(queue));
        }
        let body = Envelope::new(payload, queue).encode()?;
        self.broker.publish(queue, body).await?;
        Ok(())
    }

    /// Whether this process declared `queue` as a producer.
    pub fn is_declared(&self, queue: QueueName) -> bool {
        self.producers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&queue)
    }

    fn declare(&self, queue: QueueName) {
        self.producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(queue);
    }
}

impl fmt::Debug for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = producers.iter().map(QueueName::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Channels").field("producers", &names).finish()
    }
}

#[derive(Default)]
struct ConsumerState {
    started: bool,
    handles: Vec<JoinHandle<()>>,
}

/// The queues of one process: declarations, the producer handle, and the consumer tasks.
pub struct QueueSet {
    broker: Arc<dyn Broker>,
    config: PipelineConfig,
    definitions: BTreeMap<QueueName, QueueDefinition>,
    channels: Channels,
    shutdown: watch::Sender<bool>,
    consumers: Mutex<ConsumerState>,
}

impl QueueSet {
    /// Creates an empty set on top of `broker`.
    pub fn new(broker: Arc<dyn Broker>, config: PipelineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            channels: Channels {
                broker: broker.clone(),
                producers: Arc::new(RwLock::new(HashSet::new())),
            },
            broker,
            config,
            definitions: BTreeMap::new(),
            shutdown,
            consumers: Mutex::new(ConsumerState::default()),
        }
    }

    /// Declares a queue. Each queue can be declared once.
    pub fn declare(&mut self, definition: QueueDefinition) -> Result<&mut Self, QueueError> {
        let name = definition.name;
        if self.definitions.contains_key(&name) {
            return Err(QueueError::AlreadyDeclared(name));
        }
        if definition.role.consumes() && definition.handler.is_none() {
            return Err(QueueError::MissingHandler(name));
        }
        if definition.role.produces() {
            self.channels.declare(name);
        }
        self.definitions.insert(name, definition);
        Ok(self)
    }

    /// The producer handle of this set.
    pub fn channels(&self) -> Channels {
        self.channels.clone()
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The declaration of `queue`, if any.
    pub fn definition(&self, queue: QueueName) -> Option<&QueueDefinition> {
        self.definitions.get(&queue)
    }

    /// Spawns one consumer task per queue declared as a consumer.
    pub async fn start(&self) {
        let mut consumers = self.consumers.lock().await;
        if consumers.started {
            warn!("Consumers already started");
            return;
        }
        consumers.started = true;
        for definition in self.definitions.values() {
            if let Some(worker) = self.worker(definition) {
                let shutdown = self.shutdown.subscribe();
                consumers
                    .handles
                    .push(tokio::spawn(worker.run(shutdown)));
            }
        }
        info!("Started {} consumer(s)", consumers.handles.len());
    }

    /// Consumes `queue` in the current task until [`shutdown`](Self::shutdown).
    pub async fn consume(&self, queue: QueueName) -> Result<(), QueueError> {
        let worker = self
            .definitions
            .get(&queue)
            .and_then(|definition| self.worker(definition))
            .ok_or(QueueError::NotConsumed(queue))?;
        worker.run(self.shutdown.subscribe()).await;
        Ok(())
    }

    /// Stops fetching on every consumer and waits for in-flight batches to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles = std::mem::take(&mut self.consumers.lock().await.handles);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Consumer task ended abnormally: {}", e);
            }
        }
        info!("All consumers stopped");
    }

    fn worker(&self, definition: &QueueDefinition) -> Option<Worker> {
        if !definition.role.consumes() {
            return None;
        }
        Some(Worker {
            queue: definition.name,
            handler: definition.handler.clone()?,
            broker: self.broker.clone(),
            config: self.config.clone(),
            batch_size: definition.batch_size,
            prefetch: definition.prefetch,
        })
    }
}

impl fmt::Debug for QueueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSet")
            .field("config", &self.config)
            .field("definitions", &self.definitions)
            .finish_non_exhaustive()
    }
}
