//! Queue names and per-process queue declarations.

use crate::entity::EntityKind;
use crate::handler::Handler;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The fixed, process-wide set of queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// Title refreshes.
    App,
    /// Bundle refreshes.
    Package,
    /// Account refreshes.
    Player,
    /// Collective refreshes.
    Group,
    /// Raw upstream change batches.
    Changes,
    /// Notifications destined for live connections.
    Websockets,
    /// Time gate for retried envelopes.
    Delay,
    /// Dead-letter queue.
    Failed,
    /// Health checks.
    Test,
}

impl QueueName {
    /// All queue names.
    pub const ALL: [QueueName; 9] = [
        QueueName::App,
        QueueName::Package,
        QueueName::Player,
        QueueName::Group,
        QueueName::Changes,
        QueueName::Websockets,
        QueueName::Delay,
        QueueName::Failed,
        QueueName::Test,
    ];

    /// Wire name of the queue.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::App => "app",
            QueueName::Package => "package",
            QueueName::Player => "player",
            QueueName::Group => "group",
            QueueName::Changes => "changes",
            QueueName::Websockets => "websockets",
            QueueName::Delay => "delay",
            QueueName::Failed => "failed",
            QueueName::Test => "test",
        }
    }

    /// The entity kind refreshed through this queue, if any.
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            QueueName::App => Some(EntityKind::App),
            QueueName::Package => Some(EntityKind::Package),
            QueueName::Player => Some(EntityKind::Player),
            QueueName::Group => Some(EntityKind::Group),
            _ => None,
        }
    }

    /// Whether the queue only does bookkeeping on envelopes it never interprets.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, QueueName::Delay | QueueName::Failed)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = UnknownQueue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| UnknownQueue(s.to_string()))
    }
}

/// Returned when parsing an unknown queue name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown queue '{0}'")]
pub struct UnknownQueue(pub String);

/// How a process uses a declared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// The process only publishes to the queue.
    Producer,
    /// The process only consumes from the queue.
    Consumer,
    /// The process publishes to and consumes from the queue.
    Both,
}

impl QueueRole {
    /// Whether the role allows producing.
    pub fn produces(&self) -> bool {
        matches!(self, QueueRole::Producer | QueueRole::Both)
    }

    /// Whether the role runs a consumer.
    pub fn consumes(&self) -> bool {
        matches!(self, QueueRole::Consumer | QueueRole::Both)
    }
}

/// Declaration of one queue for the current process.
#[derive(Clone)]
pub struct QueueDefinition {
    /// The queue being declared.
    pub name: QueueName,
    /// Whether the process produces, consumes, or both.
    pub role: QueueRole,
    /// The handler consuming the queue. Producer-only declarations have none.
    pub handler: Option<Arc<dyn Handler>>,
    /// Maximum number of envelopes delivered to one handler invocation.
    pub batch_size: usize,
    /// Maximum number of unacknowledged deliveries outstanding on the queue.
    pub prefetch: usize,
}

impl QueueDefinition {
    /// Declares a queue this process only publishes to.
    pub fn producer(name: QueueName) -> Self {
        Self {
            name,
            role: QueueRole::Producer,
            handler: None,
            batch_size: 1,
            prefetch: 10,
        }
    }

    /// Declares a queue this process only consumes, with the given handler.
    pub fn consumer(name: QueueName, handler: Arc<dyn Handler>) -> Self {
        Self {
            name,
            role: QueueRole::Consumer,
            handler: Some(handler),
            batch_size: 1,
            prefetch: 10,
        }
    }

    /// Declares a queue this process both publishes to and consumes.
    pub fn both(name: QueueName, handler: Arc<dyn Handler>) -> Self {
        Self {
            role: QueueRole::Both,
            ..Self::consumer(name, handler)
        }
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the prefetch limit.
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

impl fmt::Debug for QueueDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("name", &self.name)
            .field("role", &self.role)
            .field(
                "handler",
                &self.handler.as_ref().map(|h| h.handler_name().to_string()),
            )
            .field("batch_size", &self.batch_size)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}
