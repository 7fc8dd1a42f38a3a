//! Interfaces of the external systems the pipeline keeps consistent.
//!
//! Every method returns a [`CollaboratorError`] whose [`ErrorKind`](crate::error::ErrorKind) decides
//! whether the delivery that hit it is retried or dead-lettered.

use crate::changes::ChangeRecord;
use crate::entity::{EntityId, EntityKind};
use crate::error::CollaboratorError;
use crate::payload::TransactionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type of collaborator calls.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// The stored view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDocument {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Last upstream change applied to the document.
    pub change_number: Option<TransactionId>,
    /// When the document was last refreshed.
    pub updated_at: DateTime<Utc>,
    /// Everything else.
    pub fields: serde_json::Value,
}

/// What the upstream API knows about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamEntity {
    /// Display name.
    pub name: String,
    /// Latest upstream change of the entity, if reported.
    pub change_number: Option<TransactionId>,
    /// Everything else.
    pub fields: serde_json::Value,
    /// Numeric series worth tracking over time, e.g. player counts.
    pub metrics: BTreeMap<String, f64>,
}

/// One point written to the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Series name.
    pub measurement: String,
    /// Indexed dimensions.
    pub tags: BTreeMap<String, String>,
    /// Values.
    pub fields: BTreeMap<String, f64>,
    /// Timestamp.
    pub time: DateTime<Utc>,
}

/// Primary storage of entity documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Loads a document.
    async fn get(&self, kind: EntityKind, id: EntityId)
    -> CollaboratorResult<Option<EntityDocument>>;

    /// Inserts or replaces a document.
    async fn replace(&self, document: &EntityDocument) -> CollaboratorResult<()>;

    /// Merges `fields` into an existing document's fields and bumps `updated_at`.
    async fn update_fields(
        &self,
        kind: EntityKind,
        id: EntityId,
        fields: serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> CollaboratorResult<()>;
}

/// Key-value cache with expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Reads a key.
    async fn get(&self, key: &str) -> CollaboratorResult<Option<Vec<u8>>>;

    /// Writes a key unconditionally.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CollaboratorResult<()>;

    /// Writes a key only if it is absent. Returns whether the write happened.
    ///
    /// Must be atomic: of two concurrent calls for the same absent key exactly one returns `true`.
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CollaboratorResult<bool>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> CollaboratorResult<()>;
}

/// Full-text index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Indexes or re-indexes a document.
    async fn index(&self, document: &EntityDocument) -> CollaboratorResult<()>;

    /// Removes a document from the index.
    async fn delete_document(&self, kind: EntityKind, id: EntityId) -> CollaboratorResult<()>;
}

/// Time-series store.
#[async_trait]
pub trait TimeSeries: Send + Sync {
    /// Writes one point.
    async fn write_point(&self, point: DataPoint) -> CollaboratorResult<()>;
}

/// The upstream source of truth.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Fetches an entity. `None` means the entity no longer exists upstream.
    async fn fetch(&self, kind: EntityKind, id: EntityId)
    -> CollaboratorResult<Option<UpstreamEntity>>;
}

/// Read-only lookup of display names.
#[async_trait]
pub trait NameLookup: Send + Sync {
    /// Resolves the names of `ids`. Ids without a known name are left out.
    async fn names(
        &self,
        kind: EntityKind,
        ids: &[EntityId],
    ) -> CollaboratorResult<HashMap<EntityId, String>>;
}

/// Durable storage of change records.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Inserts `records`, ignoring any whose transaction id already exists.
    ///
    /// Returns the transaction ids that were actually inserted.
    async fn insert_many(&self, records: &[ChangeRecord])
    -> CollaboratorResult<Vec<TransactionId>>;
}

/// Outbound announcement of changes, e.g. to a chat channel.
#[async_trait]
pub trait ChangeAnnouncer: Send + Sync {
    /// Announces one newly persisted change record.
    async fn announce(&self, record: &ChangeRecord) -> CollaboratorResult<()>;
}

/// The downstream stores an entity refresh writes to.
#[derive(Clone)]
pub struct Collaborators {
    /// Upstream source.
    pub upstream: Arc<dyn UpstreamApi>,
    /// Document store.
    pub documents: Arc<dyn DocumentStore>,
    /// Full-text index.
    pub search: Arc<dyn SearchIndex>,
    /// Time-series store.
    pub time_series: Arc<dyn TimeSeries>,
    /// Rendered-page cache.
    pub cache: Arc<dyn Cache>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
