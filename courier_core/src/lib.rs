//! # Courier core
//!
//! The asynchronous update pipeline: envelopes with retry bookkeeping, the producer-side dedup
//! guard, named queues on top of a pluggable [`Broker`](broker::Broker), the dispatch loop, the
//! delay queue, change aggregation and notification fan-out.

#![deny(missing_docs)]

extern crate self as courier_core;

/// Transport abstraction.
pub mod broker;
/// Change aggregation and the `changes` queue consumer.
pub mod changes;
/// Interfaces of the external stores and services.
pub mod collaborators;
/// Pipeline configuration.
pub mod config;
/// The producer-side dedup guard.
pub mod dedup;
/// The delay queue consumer.
pub mod delay;
/// Entity kinds and id validation.
pub mod entity;
/// Envelopes, deliveries and decisions.
pub mod envelope;
/// Error types.
pub mod error;
/// Live-connection fan-out.
pub mod fanout;
/// Handler traits.
pub mod handler;
/// Queue payloads.
pub mod payload;
/// Queue declarations, production and consumer tasks.
pub mod pipeline;
/// Refresh requests.
pub mod producer;
/// Queue names and definitions.
pub mod queue;
/// The entity refresh consumer.
pub mod refresh;
/// Retry policies.
pub mod retry;

mod worker;

pub use courier_derive::{HandlerName, PayloadType};
pub use handler::{Handler, HandlerName, PayloadType};

pub mod prelude {
    //! The prelude module for the `courier_core` crate.
    pub use crate::broker::{Broker, BrokerError, DeliveryTag, FetchRequest, RawMessage};
    pub use crate::changes::{ChangeRecord, ChangesHandler, aggregate};
    pub use crate::collaborators::{
        Cache, ChangeAnnouncer, ChangeStore, CollaboratorResult, Collaborators, DataPoint,
        DocumentStore, EntityDocument, NameLookup, SearchIndex, TimeSeries, UpstreamApi,
        UpstreamEntity,
    };
    pub use crate::config::{
        DeadLetterCallback, DeadLetterInfo, DedupConfig, FreshnessConfig, PerKind, PipelineConfig,
    };
    pub use crate::dedup::DedupGuard;
    pub use crate::delay::DelayHandler;
    pub use crate::entity::{EntityId, EntityKind, InvalidEntityId};
    pub use crate::envelope::{Decision, Delivery, Envelope, EnvelopeError};
    pub use crate::error::{CollaboratorError, ErrorKind, ProduceError, QueueError};
    pub use crate::fanout::{
        ConnectionClosed, FanoutHandler, Hub, LiveConnection, NotificationData,
        NotificationMessage, Notifier, Topic,
    };
    pub use crate::{Handler, HandlerName, PayloadType};
    pub use crate::payload::{
        ChangesMessage, EntityMessage, Payload, TestMessage, TransactionId,
    };
    pub use crate::pipeline::{Channels, QueueSet};
    pub use crate::producer::{ProduceOutcome, Producer};
    pub use crate::queue::{QueueDefinition, QueueName, QueueRole};
    pub use crate::refresh::RefreshHandler;
    pub use crate::retry::{Backoff, DeadLetterReason, DelayVerdict, RetryPolicies, RetryPolicy};
}
