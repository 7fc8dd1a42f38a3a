//! Grouping raw upstream changes by transaction and fanning them out.

use crate::collaborators::{ChangeAnnouncer, ChangeStore, NameLookup};
use crate::entity::{EntityId, EntityKind};
use crate::envelope::Delivery;
use crate::error::ProduceError;
use crate::fanout::{NotificationData, Notifier, Topic};
use crate::handler::{Handler, PayloadType};
use crate::payload::{ChangesMessage, Payload, TransactionId};
use crate::producer::Producer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_derive::HandlerName;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// All entities touched by one upstream transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The upstream transaction id.
    pub transaction_id: TransactionId,
    /// Ids per kind, sorted and without duplicates.
    pub entity_ids: BTreeMap<EntityKind, Vec<EntityId>>,
    /// When the record was built.
    pub created_at: DateTime<Utc>,
}

/// Folds `(transaction id, kind, entity id)` triples into one record per transaction id.
///
/// Records come out sorted by transaction id.
pub fn aggregate(
    triples: impl IntoIterator<Item = (TransactionId, EntityKind, EntityId)>,
    created_at: DateTime<Utc>,
) -> Vec<ChangeRecord> {
    let mut grouped: BTreeMap<TransactionId, BTreeMap<EntityKind, BTreeSet<EntityId>>> =
        BTreeMap::new();
    for (transaction_id, kind, id) in triples {
        grouped
            .entry(transaction_id)
            .or_default()
            .entry(kind)
            .or_default()
            .insert(id);
    }

    grouped
        .into_iter()
        .map(|(transaction_id, kinds)| ChangeRecord {
            transaction_id,
            entity_ids: kinds
                .into_iter()
                .map(|(kind, ids)| (kind, ids.into_iter().collect()))
                .collect(),
            created_at,
        })
        .collect()
}

/// Consumes the `changes` queue.
///
/// Per message: enqueue a refresh for every changed entity, persist the aggregated records, ack,
/// then broadcast the batch and announce newly persisted records.
///
/// Records are only persisted once every refresh is enqueued, so a retried batch still sees its
/// transaction ids as new and announces them.
#[derive(HandlerName)]
pub struct ChangesHandler {
    store: Arc<dyn ChangeStore>,
    names: Arc<dyn NameLookup>,
    producer: Producer,
    notifier: Notifier,
    announcer: Option<Arc<dyn ChangeAnnouncer>>,
}

impl ChangesHandler {
    /// Creates the handler.
    pub fn new(
        store: Arc<dyn ChangeStore>,
        names: Arc<dyn NameLookup>,
        producer: Producer,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            names,
            producer,
            notifier,
            announcer: None,
        }
    }

    /// Announces newly persisted records through `announcer`.
    pub fn with_announcer(mut self, announcer: Arc<dyn ChangeAnnouncer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    async fn process(&self, delivery: &Delivery, message: &ChangesMessage) {
        let records = aggregate(message.triples(), Utc::now());
        if records.is_empty() {
            delivery.ack();
            return;
        }

        for (transaction_id, kind, id) in message.triples() {
            match self.producer.produce_change(kind, id, transaction_id).await {
                Ok(()) => {}
                Err(ProduceError::Validation(e)) => {
                    warn!("Skipping refresh for change {}: {}", transaction_id, e);
                }
                Err(ProduceError::Queue(e)) => {
                    delivery.retry(format!("enqueuing refresh of {} {}: {}", kind, id, e));
                    return;
                }
            }
        }

        let inserted = match self.store.insert_many(&records).await {
            Ok(inserted) => inserted,
            Err(e) if e.kind.is_retryable() => {
                delivery.retry(format!("persisting changes: {}", e));
                return;
            }
            Err(e) => {
                delivery.fail(format!("persisting changes: {}", e));
                return;
            }
        };

        delivery.ack();
        info!(
            "Processed {} change record(s), {} new",
            records.len(),
            inserted.len()
        );

        let names = self.resolve_names(&records).await;
        self.notifier
            .publish(
                Topic::Changes,
                NotificationData::Batch {
                    batch: broadcast_rows(&records, &names),
                },
            )
            .await;

        if let Some(announcer) = &self.announcer {
            for record in records
                .iter()
                .filter(|r| inserted.contains(&r.transaction_id))
            {
                if let Err(e) = announcer.announce(record).await {
                    warn!(
                        "Failed to announce change {}: {}",
                        record.transaction_id, e
                    );
                }
            }
        }
    }

    async fn resolve_names(
        &self,
        records: &[ChangeRecord],
    ) -> HashMap<EntityKind, HashMap<EntityId, String>> {
        let mut ids: BTreeMap<EntityKind, BTreeSet<EntityId>> = BTreeMap::new();
        for record in records {
            for (kind, entity_ids) in &record.entity_ids {
                ids.entry(*kind).or_default().extend(entity_ids);
            }
        }

        let mut names = HashMap::new();
        for (kind, ids) in ids {
            let ids: Vec<EntityId> = ids.into_iter().collect();
            match self.names.names(kind, &ids).await {
                Ok(resolved) => {
                    names.insert(kind, resolved);
                }
                Err(e) => debug!("Could not resolve {} names: {}", kind, e),
            }
        }
        names
    }
}

/// Rows of the `changes` topic: `[transaction id, created at, {kind: [[id, name], ..]}]`.
fn broadcast_rows(
    records: &[ChangeRecord],
    names: &HashMap<EntityKind, HashMap<EntityId, String>>,
) -> Vec<Vec<Value>> {
    records
        .iter()
        .map(|record| {
            let entities: serde_json::Map<String, Value> = record
                .entity_ids
                .iter()
                .map(|(kind, ids)| {
                    let pairs = ids
                        .iter()
                        .map(|id| {
                            let name = names.get(kind).and_then(|n| n.get(id));
                            json!([id, name])
                        })
                        .collect();
                    (kind.to_string(), Value::Array(pairs))
                })
                .collect();
            vec![
                json!(record.transaction_id),
                json!(record.created_at.to_rfc3339()),
                Value::Object(entities),
            ]
        })
        .collect()
}

#[async_trait]
impl Handler for ChangesHandler {
    async fn handle(&self, batch: &[Delivery]) {
        for delivery in batch {
            match delivery.payload() {
                Payload::Changes(message) => self.process(delivery, message).await,
                other => {
                    delivery.fail(format!(
                        "unexpected {} payload on the changes queue",
                        other.payload_type()
                    ));
                }
            }
        }
    }
}

impl fmt::Debug for ChangesHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangesHandler")
            .field("producer", &self.producer)
            .field("notifier", &self.notifier)
            .field("announcer", &self.announcer.is_some())
            .finish_non_exhaustive()
    }
}
