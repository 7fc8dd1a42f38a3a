//! Entry point for requesting entity refreshes.

use crate::dedup::DedupGuard;
use crate::entity::{EntityId, EntityKind};
use crate::error::ProduceError;
use crate::payload::{EntityMessage, Payload, TransactionId};
use crate::pipeline::Channels;
use log::{debug, warn};

/// Result of a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceOutcome {
    /// A refresh was enqueued.
    Enqueued,
    /// A refresh for the entity is already pending. Nothing was enqueued.
    AlreadyQueued,
}

/// Enqueues entity refreshes behind the dedup guard.
#[derive(Debug, Clone)]
pub struct Producer {
    channels: Channels,
    guard: DedupGuard,
}

impl Producer {
    /// Creates a producer publishing through `channels`.
    pub fn new(channels: Channels, guard: DedupGuard) -> Self {
        Self { channels, guard }
    }

    /// Requests a refresh of entity `id`, unless one is already pending.
    ///
    /// A failing dedup cache does not block the request: the refresh is enqueued anyway.
    pub async fn produce(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<ProduceOutcome, ProduceError> {
        self.produce_message(kind, EntityMessage::new(id)).await
    }

    /// Like [`produce`](Self::produce), skipping the freshness check on the consumer side.
    pub async fn produce_forced(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<ProduceOutcome, ProduceError> {
        let message = EntityMessage {
            force: true,
            ..EntityMessage::new(id)
        };
        self.produce_message(kind, message).await
    }

    /// Requests a refresh triggered by upstream change `change_number`.
    ///
    /// Always enqueues: a change must never be dropped because an older refresh is pending. The
    /// guard is still set so that plain requests arriving meanwhile are deduplicated.
    pub async fn produce_change(
        &self,
        kind: EntityKind,
        id: EntityId,
        change_number: TransactionId,
    ) -> Result<(), ProduceError> {
        kind.validate_id(id)?;
        let payload = Payload::entity(kind, EntityMessage::with_change(id, change_number));
        self.channels.produce(kind.queue(), payload).await?;
        if let Err(e) = self.guard.mark(kind, id).await {
            warn!("Failed to set dedup guard for {} {}: {}", kind, id, e);
        }
        Ok(())
    }

    async fn produce_message(
        &self,
        kind: EntityKind,
        message: EntityMessage,
    ) -> Result<ProduceOutcome, ProduceError> {
        let id = message.id;
        kind.validate_id(id)?;

        let reserved = match self.guard.try_reserve(kind, id).await {
            Ok(true) => true,
            Ok(false) => {
                debug!("Refresh of {} {} already queued", kind, id);
                return Ok(ProduceOutcome::AlreadyQueued);
            }
            Err(e) => {
                warn!(
                    "Dedup guard unavailable for {} {}, enqueuing anyway: {}",
                    kind, id, e
                );
                false
            }
        };

        if let Err(e) = self
            .channels
            .produce(kind.queue(), Payload::entity(kind, message))
            .await
        {
            if reserved && let Err(release_err) = self.guard.release(kind, id).await {
                warn!(
                    "Failed to release dedup guard for {} {}: {}",
                    kind, id, release_err
                );
            }
            return Err(e.into());
        }
        Ok(ProduceOutcome::Enqueued)
    }
}
