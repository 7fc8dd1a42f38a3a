//! The per-entity consumer: fetch from upstream, write every downstream store, notify.

use crate::collaborators::{Collaborators, DataPoint, EntityDocument};
use crate::config::FreshnessConfig;
use crate::entity::{EntityId, EntityKind};
use crate::envelope::Delivery;
use crate::error::{CollaboratorError, ErrorKind};
use crate::fanout::Notifier;
use crate::handler::{Handler, HandlerName, PayloadType};
use crate::payload::{EntityMessage, TransactionId};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    /// The stored document was fresh enough.
    Skipped,
    /// Upstream reported no new change; only the mutable fields were rewritten.
    Touched,
    /// The document was rewritten everywhere.
    Updated,
    /// The entity no longer exists upstream and was removed from the index.
    Gone,
}

/// Refreshes entities of one kind.
///
/// Deliveries of a batch are processed concurrently. Within one delivery the downstream writes run
/// in parallel and the first failure decides the delivery.
pub struct RefreshHandler {
    kind: EntityKind,
    name: String,
    collaborators: Collaborators,
    notifier: Notifier,
    freshness: FreshnessConfig,
    rate_limit_cooldown: Duration,
}

impl RefreshHandler {
    /// Creates a handler for `kind`.
    pub fn new(kind: EntityKind, collaborators: Collaborators, notifier: Notifier) -> Self {
        Self {
            kind,
            name: format!("handler:{}-refresh", kind),
            collaborators,
            notifier,
            freshness: FreshnessConfig::default(),
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }

    /// Sets the freshness windows.
    pub fn with_freshness(mut self, freshness: FreshnessConfig) -> Self {
        self.freshness = freshness;
        self
    }

    /// Sets how long to back off after the upstream rate-limits us.
    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    async fn process(&self, delivery: &Delivery) {
        let message = match delivery.payload().as_entity() {
            Some((kind, message)) if kind == self.kind => message,
            _ => {
                delivery.fail(format!(
                    "unexpected {} payload for {} refresh",
                    delivery.payload().payload_type(),
                    self.kind
                ));
                return;
            }
        };
        if let Err(e) = self.kind.validate_id(message.id) {
            delivery.fail(e.to_string());
            return;
        }

        match self.refresh(message).await {
            Ok(outcome) => {
                delivery.ack();
                debug!("{} {}: {:?}", self.kind, message.id, outcome);
                if outcome != RefreshOutcome::Skipped {
                    self.notifier
                        .publish(self.kind.topic(), self.kind.notification(message.id))
                        .await;
                }
            }
            Err(e) => self.settle_error(delivery, message.id, e).await,
        }
    }

    async fn refresh(&self, message: &EntityMessage) -> Result<RefreshOutcome, CollaboratorError> {
        let (kind, id) = (self.kind, message.id);
        let c = &self.collaborators;
        let now = Utc::now();

        let stored = c.documents.get(kind, id).await?;
        if let Some(document) = &stored
            && !message.force
            && self.is_fresh(document, now)
            && !is_newer(message.change_number, document.change_number)
        {
            return Ok(RefreshOutcome::Skipped);
        }

        let Some(upstream) = c.upstream.fetch(kind, id).await? else {
            c.search.delete_document(kind, id).await?;
            c.cache.delete(&kind.cache_key(id)).await?;
            return Ok(RefreshOutcome::Gone);
        };

        let change_number = upstream.change_number.max(message.change_number);
        let point = DataPoint {
            measurement: kind.to_string(),
            tags: BTreeMap::from([("id".to_string(), id.to_string())]),
            fields: upstream.metrics.clone(),
            time: now,
        };
        let write_point = async {
            if point.fields.is_empty() {
                Ok(())
            } else {
                c.time_series.write_point(point.clone()).await
            }
        };

        let unchanged = stored.as_ref().is_some_and(|document| {
            document.change_number.is_some()
                && document.change_number == change_number
                && document.name == upstream.name
        });

        let outcome = if unchanged {
            tokio::try_join!(
                c.documents
                    .update_fields(kind, id, upstream.fields.clone(), now),
                write_point,
            )?;
            RefreshOutcome::Touched
        } else {
            let document = EntityDocument {
                kind,
                id,
                name: upstream.name,
                change_number,
                updated_at: now,
                fields: upstream.fields,
            };
            tokio::try_join!(
                c.documents.replace(&document),
                c.search.index(&document),
                write_point,
            )?;
            RefreshOutcome::Updated
        };

        c.cache.delete(&kind.cache_key(id)).await?;
        Ok(outcome)
    }

    fn is_fresh(&self, document: &EntityDocument, now: DateTime<Utc>) -> bool {
        let window = *self.freshness.window.get(self.kind);
        TimeDelta::from_std(window).is_ok_and(|window| now - document.updated_at < window)
    }

    async fn settle_error(&self, delivery: &Delivery, id: EntityId, error: CollaboratorError) {
        match error.kind {
            ErrorKind::RateLimited => {
                warn!(
                    "Rate limited refreshing {} {}, cooling down for {:?}",
                    self.kind, id, self.rate_limit_cooldown
                );
                sleep(self.rate_limit_cooldown).await;
                delivery.retry(error.to_string());
            }
            ErrorKind::Transient | ErrorKind::Unclassified => {
                debug!("Retrying {} {}: {}", self.kind, id, error);
                delivery.retry(error.to_string());
            }
            ErrorKind::Validation | ErrorKind::Terminal => {
                delivery.fail(error.to_string());
            }
        }
    }
}

/// Whether the change carried by a message is newer than the one applied to the stored document.
fn is_newer(message: Option<TransactionId>, stored: Option<TransactionId>) -> bool {
    match (message, stored) {
        (Some(message), Some(stored)) => message > stored,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl HandlerName for RefreshHandler {
    fn handler_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Handler for RefreshHandler {
    async fn handle(&self, batch: &[Delivery]) {
        join_all(batch.iter().map(|delivery| self.process(delivery))).await;
    }
}

impl fmt::Debug for RefreshHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshHandler")
            .field("kind", &self.kind)
            .field("freshness", &self.freshness)
            .field("rate_limit_cooldown", &self.rate_limit_cooldown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_numbers_compare() {
        assert!(is_newer(Some(10), Some(9)));
        assert!(!is_newer(Some(9), Some(9)));
        assert!(is_newer(Some(1), None));
        assert!(!is_newer(None, Some(1)));
        assert!(!is_newer(None, None));
    }
}
