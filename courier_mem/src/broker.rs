use async_trait::async_trait;
use courier_core::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<DeliveryTag, Vec<u8>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: Mutex<HashMap<QueueName, QueueState>>,
    next_tag: AtomicU64,
    changed: Notify,
    unavailable: AtomicBool,
    failing_publishes: std::sync::Mutex<HashSet<QueueName>>,
}

/// A process-local broker.
///
/// Useful for tests and single-process development setups. Messages live in memory only, and an
/// unacknowledged delivery is only redelivered when it is explicitly released.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryBroker");
        Self::default()
    }

    /// Makes every operation fail with [`BrokerError::Unavailable`] until switched back.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Makes publishes to `queue` fail until switched back.
    pub fn set_publish_failing(&self, queue: QueueName, failing: bool) {
        let mut failing_publishes = self
            .state
            .failing_publishes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if failing {
            failing_publishes.insert(queue);
        } else {
            failing_publishes.remove(&queue);
        }
    }

    /// Number of messages waiting on `queue`.
    pub async fn queue_len(&self, queue: QueueName) -> usize {
        self.state
            .queues
            .lock()
            .await
            .get(&queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of deliveries on `queue` that are neither acked nor released.
    pub async fn unacked_len(&self, queue: QueueName) -> usize {
        self.state
            .queues
            .lock()
            .await
            .get(&queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the messages waiting on `queue`, oldest first, parsed as JSON.
    ///
    /// Bodies that are not JSON show up as strings.
    pub async fn peek(&self, queue: QueueName) -> Vec<serde_json::Value> {
        self.state
            .queues
            .lock()
            .await
            .get(&queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|body| {
                        serde_json::from_slice(body).unwrap_or_else(|_| {
                            serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("in-memory broker switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: QueueName, body: Vec<u8>) -> Result<(), BrokerError> {
        self.check_available()?;
        let failing = self
            .state
            .failing_publishes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&queue);
        if failing {
            return Err(BrokerError::Backend(format!(
                "publishing to '{}' is switched off",
                queue
            )));
        }

        self.state
            .queues
            .lock()
            .await
            .entry(queue)
            .or_default()
            .ready
            .push_back(body);
        self.state.changed.notify_waiters();
        Ok(())
    }

    async fn fetch(
        &self,
        queue: QueueName,
        request: FetchRequest,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let deadline = Instant::now() + request.wait;
        loop {
            self.check_available()?;

            // Register interest before looking, so a publish in between is not missed
            let changed = self.state.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut queues = self.state.queues.lock().await;
                let state = queues.entry(queue).or_default();
                let room = request.prefetch.saturating_sub(state.unacked.len());
                let take = room.min(request.max_messages).min(state.ready.len());
                if take > 0 {
                    let mut messages = Vec::with_capacity(take);
                    for body in state.ready.drain(..take) {
                        let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                        state.unacked.insert(tag, body.clone());
                        messages.push(RawMessage { tag, body });
                    }
                    return Ok(messages);
                }
            }

            if timeout_at(deadline, changed).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, queue: QueueName, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.check_available()?;
        let removed = self
            .state
            .queues
            .lock()
            .await
            .get_mut(&queue)
            .and_then(|q| q.unacked.remove(&tag));
        match removed {
            Some(_) => {
                self.state.changed.notify_waiters();
                Ok(())
            }
            None => Err(BrokerError::UnknownDelivery { queue, tag }),
        }
    }

    async fn release(&self, queue: QueueName, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut queues = self.state.queues.lock().await;
        let state = queues.entry(queue).or_default();
        match state.unacked.remove(&tag) {
            Some(body) => {
                state.ready.push_front(body);
                drop(queues);
                self.state.changed.notify_waiters();
                Ok(())
            }
            None => Err(BrokerError::UnknownDelivery { queue, tag }),
        }
    }
}
