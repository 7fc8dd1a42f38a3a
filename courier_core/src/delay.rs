//! The time gate every retried envelope passes through.

use crate::envelope::Delivery;
use crate::handler::Handler;
use crate::pipeline::Channels;
use crate::queue::QueueName;
use crate::retry::{DelayVerdict, RetryPolicies};
use async_trait::async_trait;
use chrono::Utc;
use courier_derive::HandlerName;
use log::{debug, warn};
use std::time::Duration;
use tokio::time::sleep;

/// Consumes the delay queue, sending eligible envelopes back to their origin queue.
///
/// Envelopes that are not eligible yet go back onto the delay queue unchanged, so consumption is
/// throttled by a fixed sleep per envelope to avoid spinning on a queue full of parked work.
#[derive(HandlerName)]
pub struct DelayHandler {
    policies: RetryPolicies,
    channels: Channels,
    throttle: Duration,
}

impl DelayHandler {
    /// Creates the handler. `channels` decides which origin queues can take envelopes back.
    pub fn new(policies: RetryPolicies, channels: Channels, throttle: Duration) -> Self {
        Self {
            policies,
            channels,
            throttle,
        }
    }
}

#[async_trait]
impl Handler for DelayHandler {
    async fn handle(&self, batch: &[Delivery]) {
        for delivery in batch {
            if !self.throttle.is_zero() {
                sleep(self.throttle).await;
            }

            let envelope = delivery.envelope();
            let verdict = self.policies.evaluate(envelope, Utc::now(), |queue| {
                self.channels.is_declared(queue)
            });
            match verdict {
                DelayVerdict::DeadLetter(reason) => {
                    warn!(
                        "Giving up on envelope from '{}' after {} attempt(s): {}",
                        envelope.origin_queue, envelope.attempt, reason
                    );
                    delivery.fail(reason.to_string());
                }
                DelayVerdict::Park => {
                    delivery.requeue(QueueName::Delay);
                }
                DelayVerdict::Release(origin) => {
                    debug!(
                        "Releasing attempt {} back to '{}'",
                        envelope.attempt, origin
                    );
                    delivery.requeue(origin);
                }
            }
        }
    }
}

impl std::fmt::Debug for DelayHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayHandler")
            .field("policies", &self.policies)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}
