//! The dispatch loop run for every consumed queue.

use crate::broker::{Broker, DeliveryTag, FetchRequest, RawMessage};
use crate::config::{DeadLetterInfo, PipelineConfig};
use crate::envelope::{Decision, Delivery, Envelope};
use crate::handler::Handler;
use crate::payload::Payload;
use crate::queue::QueueName;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;

/// Consumes one queue until shutdown.
pub(crate) struct Worker {
    pub(crate) queue: QueueName,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) config: PipelineConfig,
    pub(crate) batch_size: usize,
    pub(crate) prefetch: usize,
}

impl Worker {
    /// Fetches and dispatches batches until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// A batch that has been fetched always runs to completion.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let request = FetchRequest {
            max_messages: self.batch_size,
            prefetch: self.prefetch,
            wait: self.config.fetch_wait,
        };
        let mut error_backoff = self.config.fetch_error_backoff;
        info!(
            "Consuming queue '{}' with '{}'",
            self.queue,
            self.handler.handler_name()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fetched = self.broker.fetch(self.queue, request) => fetched,
            };

            match fetched {
                Ok(messages) => {
                    error_backoff = self.config.fetch_error_backoff;
                    if !messages.is_empty() {
                        self.dispatch(messages).await;
                    }
                }
                Err(e) => {
                    error!(
                        "Failed to fetch from queue '{}': {}. Retrying in {:?}",
                        self.queue, e, error_backoff
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(error_backoff) => {}
                    }
                    error_backoff = (error_backoff * 2).min(self.config.max_fetch_error_backoff);
                }
            }
        }

        info!("Stopped consuming queue '{}'", self.queue);
    }

    /// Decodes, handles and settles one fetched batch.
    pub(crate) async fn dispatch(&self, messages: Vec<RawMessage>) {
        let mut batch = Vec::with_capacity(messages.len());
        for message in messages {
            match Envelope::decode(self.queue, &message.body) {
                Ok(envelope) => batch.push(Delivery::new(envelope, self.queue, message.tag)),
                Err(e) => self.dead_letter_malformed(message, e.to_string()).await,
            }
        }
        if batch.is_empty() {
            return;
        }

        let handled = AssertUnwindSafe(self.handler.handle(&batch))
            .catch_unwind()
            .await;
        if handled.is_err() {
            error!(
                "Handler '{}' panicked while processing a batch of {} from '{}'",
                self.handler.handler_name(),
                batch.len(),
                self.queue
            );
        }

        for delivery in &batch {
            self.settle(delivery).await;
        }
    }

    async fn settle(&self, delivery: &Delivery) {
        let decision = delivery.decision().unwrap_or_else(|| {
            warn!(
                "Handler '{}' left delivery {} on '{}' undecided, retrying it",
                self.handler.handler_name(),
                delivery.tag(),
                self.queue
            );
            Decision::Retry {
                reason: "handler returned without a decision".to_string(),
            }
        });

        match decision {
            Decision::Ack => self.ack(delivery.tag()).await,
            Decision::Retry { reason } => {
                let next = delivery.envelope().next_attempt();
                if self.forward(delivery.tag(), QueueName::Delay, &next).await {
                    debug!(
                        "Retrying delivery {} from '{}' as attempt {}: {}",
                        delivery.tag(),
                        self.queue,
                        next.attempt,
                        reason
                    );
                }
            }
            Decision::Fail { reason } => {
                let envelope = delivery.envelope();
                if self
                    .forward(delivery.tag(), QueueName::Failed, envelope)
                    .await
                {
                    warn!(
                        "Dead-lettered delivery {} from '{}' (origin '{}', attempt {}): {}",
                        delivery.tag(),
                        self.queue,
                        envelope.origin_queue,
                        envelope.attempt,
                        reason
                    );
                    self.notify_dead_letter(DeadLetterInfo {
                        queue: self.queue,
                        handler: Some(self.handler.handler_name().to_string()),
                        origin_queue: Some(envelope.origin_queue),
                        attempt: Some(envelope.attempt),
                        error_message: reason,
                    });
                }
            }
            Decision::Requeue { queue } => {
                self.forward(delivery.tag(), queue, delivery.envelope())
                    .await;
            }
        }
    }

    /// Publishes `envelope` to `destination`, then acks the source delivery.
    ///
    /// If the publish fails the source is released instead, so the broker redelivers it.
    async fn forward(
        &self,
        tag: DeliveryTag,
        destination: QueueName,
        envelope: &Envelope<Payload>,
    ) -> bool {
        let published = match envelope.encode() {
            Ok(body) => self
                .broker
                .publish(destination, body)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match published {
            Ok(()) => {
                self.ack(tag).await;
                true
            }
            Err(e) => {
                error!(
                    "Failed to publish delivery {} from '{}' to '{}': {}",
                    tag, self.queue, destination, e
                );
                self.release(tag).await;
                false
            }
        }
    }

    async fn dead_letter_malformed(&self, message: RawMessage, reason: String) {
        warn!(
            "Malformed message {} on '{}': {}",
            message.tag, self.queue, reason
        );
        match self.broker.publish(QueueName::Failed, message.body).await {
            Ok(()) => {
                self.ack(message.tag).await;
                self.notify_dead_letter(DeadLetterInfo {
                    queue: self.queue,
                    handler: Some(self.handler.handler_name().to_string()),
                    origin_queue: None,
                    attempt: None,
                    error_message: reason,
                });
            }
            Err(e) => {
                error!(
                    "Failed to dead-letter malformed message {} from '{}': {}",
                    message.tag, self.queue, e
                );
                self.release(message.tag).await;
            }
        }
    }

    fn notify_dead_letter(&self, info: DeadLetterInfo) {
        if let Some(callback) = &self.config.on_dead_letter {
            callback.on_dead_letter(&info);
        }
    }

    async fn ack(&self, tag: DeliveryTag) {
        if let Err(e) = self.broker.ack(self.queue, tag).await {
            error!(
                "Failed to ack delivery {} on '{}': {}",
                tag, self.queue, e
            );
        }
    }

    async fn release(&self, tag: DeliveryTag) {
        if let Err(e) = self.broker.release(self.queue, tag).await {
            error!(
                "Failed to release delivery {} on '{}': {}",
                tag, self.queue, e
            );
        }
    }
}
