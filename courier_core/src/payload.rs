//! Typed payloads carried by envelopes.
//!
//! Every queue carries exactly one payload shape. [`Payload`] is the sum of those shapes and is
//! decoded by looking at the queue a message arrived on, so the wire format stays a plain JSON
//! object without a type tag.

use crate::entity::{EntityId, EntityKind};
use crate::fanout::NotificationMessage;
use crate::queue::QueueName;
use chrono::{DateTime, Utc};
use courier_derive::PayloadType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upstream-assigned, monotonically increasing transaction id (the "change number").
pub type TransactionId = u64;

/// Payload of a message on one of the queues.
#[derive(Debug, Clone, PartialEq, Serialize, PayloadType)]
#[serde(untagged)]
pub enum Payload {
    /// Title refresh request.
    App(EntityMessage),
    /// Bundle refresh request.
    Package(EntityMessage),
    /// Account refresh request.
    Player(EntityMessage),
    /// Collective refresh request.
    Group(EntityMessage),
    /// A batch of upstream changes.
    Changes(ChangesMessage),
    /// A notification for live connections.
    Notification(NotificationMessage),
    /// Health check.
    Test(TestMessage),
    /// Payload of an envelope parked on a bookkeeping queue. Never interpreted.
    Opaque(serde_json::Value),
}

impl Payload {
    /// Decodes the payload of a message that arrived on `queue`.
    pub fn decode(queue: QueueName, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match queue {
            QueueName::App => Payload::App(serde_json::from_value(value)?),
            QueueName::Package => Payload::Package(serde_json::from_value(value)?),
            QueueName::Player => Payload::Player(serde_json::from_value(value)?),
            QueueName::Group => Payload::Group(serde_json::from_value(value)?),
            QueueName::Changes => Payload::Changes(serde_json::from_value(value)?),
            QueueName::Websockets => Payload::Notification(serde_json::from_value(value)?),
            QueueName::Test => Payload::Test(serde_json::from_value(value)?),
            QueueName::Delay | QueueName::Failed => Payload::Opaque(value),
        })
    }

    /// Builds the refresh payload for an entity of `kind`.
    pub fn entity(kind: EntityKind, message: EntityMessage) -> Self {
        match kind {
            EntityKind::App => Payload::App(message),
            EntityKind::Package => Payload::Package(message),
            EntityKind::Player => Payload::Player(message),
            EntityKind::Group => Payload::Group(message),
        }
    }

    /// Returns the entity refresh request carried by this payload, if any.
    pub fn as_entity(&self) -> Option<(EntityKind, &EntityMessage)> {
        match self {
            Payload::App(m) => Some((EntityKind::App, m)),
            Payload::Package(m) => Some((EntityKind::Package, m)),
            Payload::Player(m) => Some((EntityKind::Player, m)),
            Payload::Group(m) => Some((EntityKind::Group, m)),
            _ => None,
        }
    }
}

/// Request to refresh one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMessage {
    /// The entity id.
    pub id: EntityId,
    /// Transaction id of the upstream change that triggered the refresh, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<TransactionId>,
    /// Skip the freshness check.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl EntityMessage {
    /// A plain refresh request.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            change_number: None,
            force: false,
        }
    }

    /// A refresh request triggered by the upstream change `change_number`.
    pub fn with_change(id: EntityId, change_number: TransactionId) -> Self {
        Self {
            change_number: Some(change_number),
            ..Self::new(id)
        }
    }
}

/// A batch of upstream changes, one map per tracked kind.
///
/// Each map goes from entity id to the latest transaction id the entity changed in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesMessage {
    /// Changed titles.
    #[serde(default)]
    pub apps: BTreeMap<EntityId, TransactionId>,
    /// Changed bundles.
    #[serde(default)]
    pub packages: BTreeMap<EntityId, TransactionId>,
}

impl ChangesMessage {
    /// Flattens the per-kind maps into `(transaction id, kind, entity id)` triples.
    pub fn triples(&self) -> impl Iterator<Item = (TransactionId, EntityKind, EntityId)> + '_ {
        let apps = self
            .apps
            .iter()
            .map(|(id, txn)| (*txn, EntityKind::App, *id));
        let packages = self
            .packages
            .iter()
            .map(|(id, txn)| (*txn, EntityKind::Package, *id));
        apps.chain(packages)
    }

    /// Whether the message carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.packages.is_empty()
    }
}

/// Health-check payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMessage {
    /// When the health check was sent.
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PayloadType;
    use serde_json::json;

    #[test]
    fn entity_payloads_decode_by_queue() {
        let payload = Payload::decode(QueueName::Package, json!({"id": 12})).unwrap();
        assert_eq!(payload, Payload::Package(EntityMessage::new(12)));
        assert_eq!(payload.payload_type(), "Package");
        assert_eq!(
            payload.as_entity(),
            Some((EntityKind::Package, &EntityMessage::new(12)))
        );
    }

    #[test]
    fn entity_payload_with_wrong_shape_fails_to_decode() {
        assert!(Payload::decode(QueueName::App, json!({"name": "x"})).is_err());
    }

    #[test]
    fn bookkeeping_queues_keep_payload_opaque() {
        let value = json!({"id": 440, "whatever": [1, 2]});
        let payload = Payload::decode(QueueName::Delay, value.clone()).unwrap();
        assert_eq!(payload, Payload::Opaque(value.clone()));
        assert_eq!(serde_json::to_value(&payload).unwrap(), value);
    }

    #[test]
    fn entity_message_omits_defaults_on_the_wire() {
        assert_eq!(
            serde_json::to_value(Payload::App(EntityMessage::new(440))).unwrap(),
            json!({"id": 440})
        );
        assert_eq!(
            serde_json::to_value(Payload::App(EntityMessage::with_change(440, 9))).unwrap(),
            json!({"id": 440, "change_number": 9})
        );
    }

    #[test]
    fn changes_message_flattens_into_triples() {
        let message: ChangesMessage =
            serde_json::from_value(json!({"apps": {"10": 5, "30": 7}, "packages": {"99": 5}}))
                .unwrap();
        let triples: Vec<_> = message.triples().collect();
        assert_eq!(
            triples,
            vec![
                (5, EntityKind::App, 10),
                (7, EntityKind::App, 30),
                (5, EntityKind::Package, 99)
            ]
        );
        assert!(!message.is_empty());
        assert!(ChangesMessage::default().is_empty());
    }
}
