use crate::faults::Faults;
use async_trait::async_trait;
use courier_core::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// An in-memory cache with per-key expiry.
///
/// Expiry follows the tokio clock, so tests can advance it with a paused runtime.
#[derive(Clone, Debug, Default)]
pub struct TtlCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    faults: Faults,
}

impl TtlCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors to return from the next calls.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Whether `key` is present and not expired.
    pub async fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Number of stored entries, expired ones included until the next write prunes them.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Drops every entry that expired by `now`.
fn prune(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.expires_at > now);
}

#[async_trait]
impl Cache for TtlCache {
    async fn get(&self, key: &str) -> CollaboratorResult<Option<Vec<u8>>> {
        self.faults.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CollaboratorResult<()> {
        self.faults.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        prune(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CollaboratorResult<bool> {
        self.faults.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        prune(&mut entries, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CollaboratorResult<()> {
        self.faults.check()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
