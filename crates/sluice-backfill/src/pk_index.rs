//! Per-batch primary-key index
//!
//! The only state shared between the reader and the CDC event path.
//! Stage one of a fetch populates the index as soon as the page's PKs
//! are known; CDC handlers remove keys they have seen; flush consults
//! what survived. The index must therefore be safe under concurrent
//! readers and writers, and addressable by consumer id without going
//! through the reader's mailbox.

use crate::cursor::PkTuple;
use crate::message::{BatchId, ConsumerId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Concurrent `batch_id -> set<pk>` mapping for one consumer.
#[derive(Debug, Default)]
pub struct BatchPkIndex {
    batches: DashMap<BatchId, HashSet<PkTuple>>,
}

impl BatchPkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union-insert PKs under a batch. Idempotent.
    pub fn add(&self, batch_id: BatchId, pks: impl IntoIterator<Item = PkTuple>) {
        let mut entry = self.batches.entry(batch_id).or_default();
        entry.extend(pks);
    }

    /// Remove PKs from a batch. Idempotent; missing keys are ignored.
    pub fn remove(&self, batch_id: BatchId, pks: &[PkTuple]) {
        if let Some(mut entry) = self.batches.get_mut(&batch_id) {
            for pk in pks {
                entry.remove(pk);
            }
        }
    }

    /// Remove PKs from every batch currently tracked.
    pub fn remove_from_all(&self, pks: &[PkTuple]) {
        for mut entry in self.batches.iter_mut() {
            for pk in pks {
                entry.value_mut().remove(pk);
            }
        }
    }

    /// Check membership of a PK in a batch.
    pub fn contains(&self, batch_id: BatchId, pk: &PkTuple) -> bool {
        self.batches
            .get(&batch_id)
            .map(|set| set.contains(pk))
            .unwrap_or(false)
    }

    /// All batch ids currently tracked.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.batches.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop a batch's entire key set.
    pub fn delete(&self, batch_id: BatchId) {
        self.batches.remove(&batch_id);
    }

    /// Number of PKs tracked under a batch.
    pub fn len(&self, batch_id: BatchId) -> usize {
        self.batches.get(&batch_id).map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Process-wide registry of PK indexes, keyed by consumer id.
///
/// [`PkIndexRegistry::global`] is the externally-addressable handle:
/// workers register their index there at startup and release it at
/// termination, and the CDC message handler resolves a consumer's
/// index through it and mutates it directly, never touching any
/// reader's mailbox. Registration is idempotent; a lookup for an
/// unregistered consumer is a silent no-op so CDC can race worker
/// startup and shutdown. Standalone instances exist only for unit
/// tests of the registry itself.
#[derive(Debug, Default)]
pub struct PkIndexRegistry {
    indexes: DashMap<ConsumerId, Arc<BatchPkIndex>>,
}

impl PkIndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-global registry.
    pub fn global() -> &'static PkIndexRegistry {
        static GLOBAL: OnceLock<PkIndexRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PkIndexRegistry::new)
    }

    /// Register (or re-resolve) the index for a consumer. Idempotent.
    pub fn register(&self, consumer_id: ConsumerId) -> Arc<BatchPkIndex> {
        self.indexes
            .entry(consumer_id)
            .or_insert_with(|| Arc::new(BatchPkIndex::new()))
            .clone()
    }

    /// Drop a consumer's index at worker termination.
    pub fn release(&self, consumer_id: ConsumerId) {
        self.indexes.remove(&consumer_id);
    }

    /// Resolve a consumer's index, if a worker is running for it.
    pub fn get(&self, consumer_id: ConsumerId) -> Option<Arc<BatchPkIndex>> {
        self.indexes.get(&consumer_id).map(|entry| entry.clone())
    }

    /// Hot path for the CDC event handler: drop the given PKs from all
    /// batches of this consumer. No-op when no worker is registered.
    pub fn pks_seen(&self, consumer_id: ConsumerId, pks: &[PkTuple]) {
        match self.get(consumer_id) {
            Some(index) => index.remove_from_all(pks),
            None => {
                debug!(%consumer_id, count = pks.len(), "pks_seen with no live reader, ignoring")
            }
        }
    }
}
