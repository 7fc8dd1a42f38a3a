//! Catalog entity kinds tracked by the pipeline.

use crate::fanout::{NotificationData, Topic};
use crate::queue::QueueName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a catalog entity. Accounts use 64-bit ids, everything else fits in 32 bits.
pub type EntityId = u64;

/// Smallest valid account id (the individual-account base of the upstream id space).
pub const PLAYER_ID_BASE: EntityId = 76_561_197_960_265_728;

/// Largest valid account id.
pub const PLAYER_ID_MAX: EntityId = PLAYER_ID_BASE + u32::MAX as EntityId;

/// The kinds of catalog entity the pipeline keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A title.
    App,
    /// A bundle of titles.
    Package,
    /// An account.
    Player,
    /// A collective of accounts.
    Group,
}

impl EntityKind {
    /// All entity kinds, in a stable order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::App,
        EntityKind::Package,
        EntityKind::Player,
        EntityKind::Group,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::App => "app",
            EntityKind::Package => "package",
            EntityKind::Player => "player",
            EntityKind::Group => "group",
        }
    }

    /// The queue refreshes for this kind are produced on.
    pub fn queue(&self) -> QueueName {
        match self {
            EntityKind::App => QueueName::App,
            EntityKind::Package => QueueName::Package,
            EntityKind::Player => QueueName::Player,
            EntityKind::Group => QueueName::Group,
        }
    }

    /// The live-page topic an update of this kind is pushed to.
    pub fn topic(&self) -> Topic {
        match self {
            EntityKind::App => Topic::App,
            EntityKind::Package => Topic::Package,
            EntityKind::Player => Topic::Player,
            EntityKind::Group => Topic::Group,
        }
    }

    /// Notification payload announcing an update of entity `id`.
    ///
    /// Account ids exceed what browsers can represent as numbers, so they travel as strings.
    pub fn notification(&self, id: EntityId) -> NotificationData {
        match self {
            EntityKind::Player => NotificationData::Key { id: id.to_string() },
            _ => NotificationData::Id { id },
        }
    }

    /// Key under which rendered data for entity `id` is cached.
    pub fn cache_key(&self, id: EntityId) -> String {
        format!("{}-{}", self.as_str(), id)
    }

    /// Checks that `id` can ever be a legitimate id of this kind.
    pub fn validate_id(&self, id: EntityId) -> Result<(), InvalidEntityId> {
        let valid = match self {
            EntityKind::App | EntityKind::Package => id <= u32::MAX as EntityId,
            EntityKind::Group => id > 0 && id <= u32::MAX as EntityId,
            EntityKind::Player => (PLAYER_ID_BASE + 1..=PLAYER_ID_MAX).contains(&id),
        };
        if valid {
            Ok(())
        } else {
            Err(InvalidEntityId { kind: *self, id })
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(EntityKind::App),
            "package" => Ok(EntityKind::Package),
            "player" => Ok(EntityKind::Player),
            "group" => Ok(EntityKind::Group),
            other => Err(UnknownEntityKind(other.to_string())),
        }
    }
}

/// Returned when an id fails domain validation for its kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{id} is not a valid {kind} id")]
pub struct InvalidEntityId {
    /// The kind the id was validated against.
    pub kind: EntityKind,
    /// The rejected id.
    pub id: EntityId,
}

/// Returned when parsing an unknown entity kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity kind '{0}'")]
pub struct UnknownEntityKind(pub String);
