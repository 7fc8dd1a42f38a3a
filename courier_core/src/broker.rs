//! The transport behind the named queues.
//!
//! A [`Broker`] moves opaque byte payloads between queues with at-least-once semantics: a fetched
//! message stays leased to the fetcher until it is acknowledged or released, and a lease that is
//! never settled eventually makes the message visible again.

use crate::queue::QueueName;
use async_trait::async_trait;
use std::time::Duration;

/// Identifies one delivery of a message for acknowledgement.
pub type DeliveryTag = u64;

/// A message as fetched from the transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Tag to settle the delivery with.
    pub tag: DeliveryTag,
    /// Encoded envelope.
    pub body: Vec<u8>,
}

/// Parameters of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Maximum number of messages returned.
    pub max_messages: usize,
    /// Maximum number of unacknowledged deliveries the queue may have outstanding.
    pub prefetch: usize,
    /// How long to wait for a message when the queue is empty.
    pub wait: Duration,
}

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The transport cannot be reached right now.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The delivery tag is unknown or already settled.
    #[error("unknown delivery {tag} on queue '{queue}'")]
    UnknownDelivery {
        /// Queue the tag was settled on.
        queue: QueueName,
        /// The unknown tag.
        tag: DeliveryTag,
    },
    /// Any other backend failure.
    #[error("broker backend error: {0}")]
    Backend(String),
}

/// Transport interface used by producers and the dispatch loop.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends `body` to `queue`.
    async fn publish(&self, queue: QueueName, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Leases up to `request.max_messages` messages from `queue`, waiting up to
    /// `request.wait` for the first one. Returns an empty batch on timeout.
    async fn fetch(
        &self,
        queue: QueueName,
        request: FetchRequest,
    ) -> Result<Vec<RawMessage>, BrokerError>;

    /// Removes a leased message for good.
    async fn ack(&self, queue: QueueName, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Returns a leased message to the queue for redelivery.
    async fn release(&self, queue: QueueName, tag: DeliveryTag) -> Result<(), BrokerError>;
}
