//! In-memory cache of enrolled embeddings, refreshed in bulk from a repository.

use crate::types::KnownIdentity;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("embedding repository unavailable: {0}")]
    Repository(String),
}

/// Source of truth for enrolled faces.
pub trait EmbeddingRepository: Send + Sync {
    /// All embeddings of active identities, in a stable order.
    fn list_active_encodings(&self) -> Result<Vec<KnownIdentity>, StoreError>;
}

/// Immutable view of the known set taken for one matching pass.
#[derive(Debug, Clone, Default)]
pub struct Snapshot(Arc<Vec<KnownIdentity>>);

impl Snapshot {
    /// Distinct display names, for logging.
    pub fn display_names(&self) -> BTreeSet<&str> {
        self.0.iter().map(|k| k.display_name.as_str()).collect()
    }
}

impl Deref for Snapshot {
    type Target = [KnownIdentity];

    fn deref(&self) -> &[KnownIdentity] {
        &self.0
    }
}

/// Shared, swap-on-reload embedding cache.
///
/// `load` builds the new set off-lock and swaps an `Arc` in; `snapshot`
/// clones that `Arc`, so a reader holds the old set until it drops it.
pub struct EmbeddingStore {
    repository: Arc<dyn EmbeddingRepository>,
    current: RwLock<Snapshot>,
}

impl EmbeddingStore {
    /// Create an empty store. Call [`load`](Self::load) to populate it.
    pub fn new(repository: Arc<dyn EmbeddingRepository>) -> Self {
        Self {
            repository,
            current: RwLock::new(Snapshot::default()),
        }
    }

    /// Replace the cached set with the repository's current contents.
    /// On error the previous set stays in place. Entries whose dimension
    /// differs from the majority are dropped with a warning.
    pub fn load(&self) -> Result<usize, StoreError> {
        let rows = retain_dominant_dimension(self.repository.list_active_encodings()?);
        let fresh = Snapshot(Arc::new(rows));
        let count = fresh.len();

        tracing::info!(
            encodings = count,
            identities = ?fresh.display_names(),
            "loaded face encodings"
        );

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
        Ok(count)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn retain_dominant_dimension(mut rows: Vec<KnownIdentity>) -> Vec<KnownIdentity> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.embedding.dim() > 0) {
        *counts.entry(row.embedding.dim()).or_default() += 1;
    }
    // Most rows win; on a tie the larger dimension.
    let Some((&dim, _)) = counts.iter().max_by_key(|(_, count)| **count) else {
        return Vec::new();
    };

    rows.retain(|row| {
        let keep = row.embedding.dim() == dim;
        if !keep {
            tracing::warn!(
                identity_id = row.identity_id,
                name = %row.display_name,
                dim = row.embedding.dim(),
                expected = dim,
                "dropping face encoding of unexpected dimension"
            );
        }
        keep
    });
    rows
}
