use crate::faults::Faults;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

type Key = (EntityKind, EntityId);

/// An in-memory document store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<Mutex<HashMap<Key, EntityDocument>>>,
    faults: Faults,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors to return from the next calls.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Seeds a document.
    pub async fn insert(&self, document: EntityDocument) {
        self.documents
            .lock()
            .await
            .insert((document.kind, document.id), document);
    }

    /// The stored document, if any.
    pub async fn document(&self, kind: EntityKind, id: EntityId) -> Option<EntityDocument> {
        self.documents.lock().await.get(&(kind, id)).cloned()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> CollaboratorResult<Option<EntityDocument>> {
        self.faults.check()?;
        Ok(self.document(kind, id).await)
    }

    async fn replace(&self, document: &EntityDocument) -> CollaboratorResult<()> {
        self.faults.check()?;
        self.insert(document.clone()).await;
        Ok(())
    }

    async fn update_fields(
        &self,
        kind: EntityKind,
        id: EntityId,
        fields: serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> CollaboratorResult<()> {
        self.faults.check()?;
        let mut documents = self.documents.lock().await;
        let document = documents.get_mut(&(kind, id)).ok_or_else(|| {
            CollaboratorError::terminal(format!("no stored document for {} {}", kind, id))
        })?;
        match (&mut document.fields, fields) {
            (serde_json::Value::Object(existing), serde_json::Value::Object(update)) => {
                existing.extend(update);
            }
            (existing, update) => *existing = update,
        }
        document.updated_at = updated_at;
        Ok(())
    }
}

/// An in-memory full-text index.
#[derive(Clone, Debug, Default)]
pub struct InMemorySearchIndex {
    documents: Arc<Mutex<HashMap<Key, EntityDocument>>>,
    faults: Faults,
}

impl InMemorySearchIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors to return from the next calls.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Whether the entity is indexed.
    pub async fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.documents.lock().await.contains_key(&(kind, id))
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index(&self, document: &EntityDocument) -> CollaboratorResult<()> {
        self.faults.check()?;
        self.documents
            .lock()
            .await
            .insert((document.kind, document.id), document.clone());
        Ok(())
    }

    async fn delete_document(&self, kind: EntityKind, id: EntityId) -> CollaboratorResult<()> {
        self.faults.check()?;
        self.documents.lock().await.remove(&(kind, id));
        Ok(())
    }
}

/// An in-memory time-series store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTimeSeries {
    points: Arc<Mutex<Vec<DataPoint>>>,
    faults: Faults,
}

impl InMemoryTimeSeries {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors to return from the next calls.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Every point written so far.
    pub async fn points(&self) -> Vec<DataPoint> {
        self.points.lock().await.clone()
    }
}

#[async_trait]
impl TimeSeries for InMemoryTimeSeries {
    async fn write_point(&self, point: DataPoint) -> CollaboratorResult<()> {
        self.faults.check()?;
        self.points.lock().await.push(point);
        Ok(())
    }
}

/// An in-memory change store. Inserting an existing transaction id is a no-op.
#[derive(Clone, Debug, Default)]
pub struct InMemoryChangeStore {
    records: Arc<Mutex<BTreeMap<TransactionId, ChangeRecord>>>,
    faults: Faults,
}

impl InMemoryChangeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors to return from the next calls.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Every stored record, by transaction id.
    pub async fn records(&self) -> Vec<ChangeRecord> {
        self.records.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl ChangeStore for InMemoryChangeStore {
    async fn insert_many(
        &self,
        records: &[ChangeRecord],
    ) -> CollaboratorResult<Vec<TransactionId>> {
        self.faults.check()?;
        let mut stored = self.records.lock().await;
        let mut inserted = Vec::new();
        for record in records {
            if !stored.contains_key(&record.transaction_id) {
                stored.insert(record.transaction_id, record.clone());
                inserted.push(record.transaction_id);
            }
        }
        Ok(inserted)
    }
}

/// A name lookup over a fixed table.
#[derive(Clone, Debug, Default)]
pub struct StaticNameLookup {
    names: HashMap<Key, String>,
}

impl StaticNameLookup {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a name.
    pub fn with_name(mut self, kind: EntityKind, id: EntityId, name: impl Into<String>) -> Self {
        self.names.insert((kind, id), name.into());
        self
    }
}

#[async_trait]
impl NameLookup for StaticNameLookup {
    async fn names(
        &self,
        kind: EntityKind,
        ids: &[EntityId],
    ) -> CollaboratorResult<HashMap<EntityId, String>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.names.get(&(kind, *id)).map(|name| (*id, name.clone())))
            .collect())
    }
}

/// An upstream API answering from a table of entities.
///
/// Entities missing from the table are reported as gone.
#[derive(Clone, Debug, Default)]
pub struct ScriptedUpstream {
    entities: Arc<Mutex<HashMap<Key, UpstreamEntity>>>,
    calls: Arc<AtomicUsize>,
    faults: Faults,
}

impl ScriptedUpstream {
    /// Creates an upstream that knows no entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors to return from the next calls.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Sets what upstream reports for an entity.
    pub async fn insert(&self, kind: EntityKind, id: EntityId, entity: UpstreamEntity) {
        self.entities.lock().await.insert((kind, id), entity);
    }

    /// Makes an entity disappear upstream.
    pub async fn remove(&self, kind: EntityKind, id: EntityId) {
        self.entities.lock().await.remove(&(kind, id));
    }

    /// Number of fetches so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamApi for ScriptedUpstream {
    async fn fetch(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> CollaboratorResult<Option<UpstreamEntity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.faults.check()?;
        Ok(self.entities.lock().await.get(&(kind, id)).cloned())
    }
}

/// An announcer that remembers what it announced.
#[derive(Clone, Debug, Default)]
pub struct RecordingAnnouncer {
    announced: Arc<Mutex<Vec<ChangeRecord>>>,
    faults: Faults,
}

impl RecordingAnnouncer {
    /// Creates an announcer with nothing announced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors to return from the next calls.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Everything announced so far.
    pub async fn announced(&self) -> Vec<ChangeRecord> {
        self.announced.lock().await.clone()
    }
}

#[async_trait]
impl ChangeAnnouncer for RecordingAnnouncer {
    async fn announce(&self, record: &ChangeRecord) -> CollaboratorResult<()> {
        self.faults.check()?;
        self.announced.lock().await.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> EntityDocument {
        EntityDocument {
            kind: EntityKind::App,
            id: 440,
            name: "Team Fortress 2".to_string(),
            change_number: Some(1),
            updated_at: Utc::now(),
            fields: json!({"type": "game", "price": 0}),
        }
    }

    #[tokio::test]
    async fn update_fields_merges_objects() {
        let store = InMemoryDocumentStore::new();
        store.insert(document()).await;
        let later = Utc::now();
        store
            .update_fields(EntityKind::App, 440, json!({"price": 999}), later)
            .await
            .unwrap();
        let stored = store.document(EntityKind::App, 440).await.unwrap();
        assert_eq!(stored.fields, json!({"type": "game", "price": 999}));
        assert_eq!(stored.updated_at, later);
    }

    #[tokio::test]
    async fn update_fields_of_missing_document_is_terminal() {
        let store = InMemoryDocumentStore::new();
        let err = store
            .update_fields(EntityKind::App, 1, json!({}), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Terminal);
    }

    #[tokio::test]
    async fn change_store_ignores_known_transactions() {
        let store = InMemoryChangeStore::new();
        let records = aggregate([(5, EntityKind::App, 10), (7, EntityKind::App, 30)], Utc::now());
        assert_eq!(store.insert_many(&records).await.unwrap(), vec![5, 7]);
        assert!(store.insert_many(&records).await.unwrap().is_empty());
        assert_eq!(store.records().await.len(), 2);
    }

    #[tokio::test]
    async fn static_names_skip_unknown_ids() {
        let names = StaticNameLookup::new().with_name(EntityKind::App, 440, "Team Fortress 2");
        let resolved = names.names(EntityKind::App, &[440, 570]).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&440], "Team Fortress 2");
    }
}
