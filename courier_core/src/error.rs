//! Error types shared across the pipeline.

use crate::broker::BrokerError;
use crate::entity::InvalidEntityId;
use crate::queue::QueueName;
use std::fmt;

/// How a collaborator failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Worth retrying later.
    Transient,
    /// The collaborator asked us to slow down. Retried after a cooldown.
    RateLimited,
    /// The input can never succeed.
    Validation,
    /// The collaborator gave a definitive negative answer.
    Terminal,
    /// Nothing is known about the failure. Retried.
    Unclassified,
}

impl ErrorKind {
    /// Whether a delivery that hit this error should be retried rather than dead-lettered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Unclassified
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Validation => "validation",
            ErrorKind::Terminal => "terminal",
            ErrorKind::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

/// Error returned by every collaborator trait.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct CollaboratorError {
    /// Classification driving the retry decision.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl CollaboratorError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// A rate-limit response.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    /// Input that can never succeed.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// A definitive failure.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Terminal, message)
    }

    /// A failure nothing is known about.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unclassified, message)
    }
}

/// Errors raised by queue declaration and production.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue was never declared as a producer in this process.
    #[error("channel not found: queue '{0}' is not declared as a producer")]
    ChannelNotFound(QueueName),
    /// The queue was declared twice.
    #[error("queue '{0}' is already declared")]
    AlreadyDeclared(QueueName),
    /// The queue is not declared as a consumer in this process.
    #[error("queue '{0}' is not declared as a consumer")]
    NotConsumed(QueueName),
    /// A consumer declaration came without a handler.
    #[error("queue '{0}' is declared as a consumer but has no handler")]
    MissingHandler(QueueName),
    /// The transport failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    /// The envelope could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised when requesting an entity refresh.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    /// The id can never be valid for its kind.
    #[error(transparent)]
    Validation(#[from] InvalidEntityId),
    /// The refresh could not be enqueued.
    #[error(transparent)]
    Queue(#[from] QueueError),
}
