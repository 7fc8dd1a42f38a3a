//! Producer-side guard against enqueuing the same refresh twice.
//!
//! The guard is a cache entry that only expires. It bounds pending refreshes to one per entity per
//! TTL window; it does not coordinate consumers.

use crate::collaborators::{Cache, CollaboratorResult};
use crate::config::DedupConfig;
use crate::entity::{EntityId, EntityKind};
use std::sync::Arc;

const SENTINEL: &[u8] = b"1";

/// Cache key guarding entity `id` of `kind`.
pub fn guard_key(kind: EntityKind, id: EntityId) -> String {
    format!("{}-in-queue-{}", kind, id)
}

/// Reserves refreshes in the shared cache.
#[derive(Clone)]
pub struct DedupGuard {
    cache: Arc<dyn Cache>,
    config: DedupConfig,
}

impl DedupGuard {
    /// Creates a guard over `cache`.
    pub fn new(cache: Arc<dyn Cache>, config: DedupConfig) -> Self {
        Self { cache, config }
    }

    /// Sets the guard for `(kind, id)` unless one already exists.
    ///
    /// Returns `false` when a refresh is already pending.
    pub async fn try_reserve(&self, kind: EntityKind, id: EntityId) -> CollaboratorResult<bool> {
        self.cache
            .add(&guard_key(kind, id), SENTINEL.to_vec(), *self.config.ttl.get(kind))
            .await
    }

    /// Sets the guard for `(kind, id)` whether or not one exists.
    pub async fn mark(&self, kind: EntityKind, id: EntityId) -> CollaboratorResult<()> {
        self.cache
            .set(&guard_key(kind, id), SENTINEL.to_vec(), *self.config.ttl.get(kind))
            .await
    }

    /// Clears the guard, used when the reserved refresh could not be enqueued.
    pub async fn release(&self, kind: EntityKind, id: EntityId) -> CollaboratorResult<()> {
        self.cache.delete(&guard_key(kind, id)).await
    }
}

impl std::fmt::Debug for DedupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
