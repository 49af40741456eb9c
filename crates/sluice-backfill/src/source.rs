//! Source database port
//!
//! The reader never talks to a database driver directly; the embedding
//! pipeline supplies an adapter implementing [`SourceDb`] (queries and
//! LSN probes) and [`WatermarkEmitter`] (markers written through the
//! replication slot). Connections are borrowed per call from whatever
//! pool the adapter wraps.

use crate::cursor::{Cursor, PkTuple};
use crate::error::Result;
use crate::message::{BackfillId, BatchId, ConsumerId, Lsn, RowMessage, TableOid};
use async_trait::async_trait;

/// Result of one PK scan page.
#[derive(Debug, Clone)]
pub struct PkScanPage {
    /// Primary-key tuples in sort order. Empty means the table is
    /// exhausted past the cursor.
    pub pks: Vec<PkTuple>,
    /// Cursor to resume the next scan from; `None` when `pks` is empty.
    pub next_cursor: Option<Cursor>,
}

impl PkScanPage {
    pub fn is_empty(&self) -> bool {
        self.pks.is_empty()
    }
}

/// Source database adapter.
///
/// `include_min` toggles `>=` versus `>` on the leading sort key; it is
/// true only when the cursor equals the backfill's configured minimum.
#[async_trait]
pub trait SourceDb: Send + Sync + 'static {
    /// Keyset-paginated scan of primary keys past the cursor.
    async fn scan_pks(
        &self,
        table: TableOid,
        cursor: &Cursor,
        limit: usize,
        include_min: bool,
    ) -> Result<PkScanPage>;

    /// Fetch full rows for the same range, filtered for the consumer.
    ///
    /// Returned messages are in cursor order and a superset-by-PK of
    /// what the sink will receive; the flush-time PK filter narrows
    /// them further.
    async fn fetch_rows(
        &self,
        consumer: ConsumerId,
        table: TableOid,
        cursor: &Cursor,
        limit: usize,
        include_min: bool,
    ) -> Result<Vec<RowMessage>>;

    /// Current write position of the source's WAL.
    async fn current_wal_lsn(&self) -> Result<Lsn>;

    /// Confirmed position of the named replication slot.
    ///
    /// Returns [`crate::BackfillError::SlotNotFound`] when the slot does
    /// not exist; that is an unrecoverable configuration error.
    async fn fetch_slot_lsn(&self, slot_name: &str) -> Result<Lsn>;
}

/// Writes watermark markers into the CDC stream through the slot.
///
/// A low watermark before the row fetch and a high watermark after it
/// bracket the batch, letting the pipeline correlate the fetch with
/// stream positions and deliver the matching `flush_batch` call.
#[async_trait]
pub trait WatermarkEmitter: Send + Sync + 'static {
    async fn emit_low_watermark(
        &self,
        backfill_id: BackfillId,
        batch_id: BatchId,
        table: TableOid,
    ) -> Result<()>;

    async fn emit_high_watermark(
        &self,
        backfill_id: BackfillId,
        batch_id: BatchId,
        table: TableOid,
    ) -> Result<()>;
}
