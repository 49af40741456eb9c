//! Backfill registry port
//!
//! Persists the advancing cursor and progress counters, and is the
//! source of truth for whether the backfill (and its consumer) still
//! exist and are active. The only state the core persists is the
//! keyset cursor and the counters; batches never touch storage.

use crate::cursor::Cursor;
use crate::error::Result;
use crate::message::{BackfillId, ConsumerId, TableOid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registry view of a backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRecord {
    pub id: BackfillId,
    pub consumer_id: ConsumerId,
    pub table_oid: TableOid,
    /// Replication slot the consumer's pipeline reads from.
    pub slot_name: String,
    /// Configured minimum cursor; the first scan is inclusive of it.
    pub initial_min_cursor: Cursor,
    /// False once the backfill is deactivated.
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

/// Increments applied to the backfill's progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDelta {
    /// Rows scanned out of the source table.
    pub rows_processed: u64,
    /// Rows actually handed to the SMS.
    pub rows_ingested: u64,
}

impl ProgressDelta {
    pub fn is_zero(&self) -> bool {
        self.rows_processed == 0 && self.rows_ingested == 0
    }
}

/// Backfill registry adapter.
#[async_trait]
pub trait BackfillStore: Send + Sync + 'static {
    /// Refresh the backfill (and its consumer) from the registry.
    ///
    /// Errors: [`crate::BackfillError::ConsumerMissing`] when the owning
    /// consumer record is gone.
    async fn fetch_backfill(&self, id: BackfillId) -> Result<BackfillRecord>;

    /// The persisted cursor, if a previous run saved one.
    async fn fetch_cursor(&self, id: BackfillId) -> Result<Option<Cursor>>;

    /// Persist the advancing cursor.
    async fn update_cursor(&self, id: BackfillId, cursor: &Cursor) -> Result<()>;

    /// Remove the persisted cursor once the backfill completes.
    async fn delete_cursor(&self, id: BackfillId) -> Result<()>;

    /// Mark the backfill finished for its consumer.
    async fn backfill_finished(&self, id: BackfillId, consumer: ConsumerId) -> Result<()>;

    /// Apply progress-counter increments.
    async fn update_counters(&self, id: BackfillId, delta: ProgressDelta) -> Result<()>;
}
