//! The retry-aware wrapper around every unit of work, and the per-delivery decision slot.

use crate::broker::DeliveryTag;
use crate::payload::Payload;
use crate::queue::QueueName;
use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Wire format of a message on any queue.
///
/// Serialized as `{"message": .., "attempt": .., "first_seen": .., "origin_queue": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// The payload.
    pub message: P,
    /// Delivery attempts so far, starting at 1.
    pub attempt: u32,
    /// When the unit of work was first produced. Never changes across retries.
    pub first_seen: DateTime<Utc>,
    /// Queue the envelope returns to after a hop through the delay queue.
    pub origin_queue: QueueName,
}

/// Errors raised when decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The body is not a valid envelope, or its payload does not match the queue.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// Attempts start at 1.
    #[error("malformed envelope: attempt must be at least 1")]
    InvalidAttempt,
}

impl<P> Envelope<P> {
    /// Wraps a freshly produced payload destined for `origin_queue`.
    pub fn new(message: P, origin_queue: QueueName) -> Self {
        Self {
            message,
            attempt: 1,
            first_seen: Utc::now(),
            origin_queue,
        }
    }

    /// Time elapsed since the envelope was first produced.
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.first_seen
    }
}

impl<P: Clone> Envelope<P> {
    /// The same envelope with its attempt counter bumped.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

impl<P: Serialize> Envelope<P> {
    /// Serializes the envelope for the transport.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Envelope<Payload> {
    /// Decodes an envelope fetched from `queue`, interpreting the payload by the queue's type.
    pub fn decode(queue: QueueName, body: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: Envelope<serde_json::Value> = serde_json::from_slice(body)?;
        if raw.attempt == 0 {
            return Err(EnvelopeError::InvalidAttempt);
        }
        Ok(Envelope {
            message: Payload::decode(queue, raw.message)?,
            attempt: raw.attempt,
            first_seen: raw.first_seen,
            origin_queue: raw.origin_queue,
        })
    }
}

/// The terminal decision taken for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Processing finished. The message is removed.
    Ack,
    /// Processing should be attempted again later through the delay queue.
    Retry {
        /// Why the attempt failed.
        reason: String,
    },
    /// Processing can never succeed. The envelope goes to the dead-letter queue.
    Fail {
        /// Why the envelope was dead-lettered.
        reason: String,
    },
    /// The envelope is moved unchanged to another queue.
    Requeue {
        /// Destination queue.
        queue: QueueName,
    },
}

#[derive(Debug, Default)]
struct DecisionSlot {
    handled: AtomicBool,
    decision: Mutex<Option<Decision>>,
}

/// One delivery of an envelope to a handler.
///
/// Cloning is cheap and every clone shares the same decision slot, so a delivery can be moved into
/// concurrent sub-tasks. The first decision wins; later ones are ignored.
#[derive(Debug, Clone)]
pub struct Delivery {
    envelope: Arc<Envelope<Payload>>,
    queue: QueueName,
    tag: DeliveryTag,
    slot: Arc<DecisionSlot>,
}

impl Delivery {
    /// Wraps a decoded envelope fetched from `queue` under `tag`.
    pub fn new(envelope: Envelope<Payload>, queue: QueueName, tag: DeliveryTag) -> Self {
        Self {
            envelope: Arc::new(envelope),
            queue,
            tag,
            slot: Arc::new(DecisionSlot::default()),
        }
    }

    /// The decoded envelope.
    pub fn envelope(&self) -> &Envelope<Payload> {
        &self.envelope
    }

    /// The payload.
    pub fn payload(&self) -> &Payload {
        &self.envelope.message
    }

    /// Queue the delivery was fetched from.
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Transport tag of the delivery.
    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    /// Whether a decision has been taken.
    pub fn is_handled(&self) -> bool {
        self.slot.handled.load(Ordering::Acquire)
    }

    /// Acknowledges the delivery. Returns `false` if a decision was already taken.
    pub fn ack(&self) -> bool {
        self.decide(Decision::Ack)
    }

    /// Schedules a retry through the delay queue. Returns `false` if a decision was already taken.
    pub fn retry(&self, reason: impl Into<String>) -> bool {
        self.decide(Decision::Retry {
            reason: reason.into(),
        })
    }

    /// Dead-letters the envelope. Returns `false` if a decision was already taken.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.decide(Decision::Fail {
            reason: reason.into(),
        })
    }

    /// Moves the envelope unchanged to `queue`. Returns `false` if a decision was already taken.
    pub fn requeue(&self, queue: QueueName) -> bool {
        self.decide(Decision::Requeue { queue })
    }

    /// The decision taken, if any.
    pub fn decision(&self) -> Option<Decision> {
        self.slot
            .decision
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn decide(&self, decision: Decision) -> bool {
        if self
            .slot
            .handled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "Ignoring {:?} for delivery {} on '{}': already handled",
                decision, self.tag, self.queue
            );
            return false;
        }
        *self
            .slot
            .decision
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(decision);
        true
    }
}
