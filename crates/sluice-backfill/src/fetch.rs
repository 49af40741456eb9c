//! Two-stage fetch bodies
//!
//! Stage one scans primary keys past the cursor; it is cheap and its
//! result seeds the PK index immediately, so CDC events arriving while
//! stage two is still running can already cancel rows. Stage two
//! fetches the full rows for the same range, bracketed by a low and a
//! high watermark written through the replication slot.
//!
//! Both stages run their query under the per-query timeout budget;
//! exhausting it yields the typed timeout error that feeds the
//! page-size optimizer rather than the failure counter.

use crate::cursor::Cursor;
use crate::error::{BackfillError, Result};
use crate::message::{BackfillId, BatchId, ConsumerId, Lsn, RowMessage, TableOid};
use crate::source::{PkScanPage, SourceDb, WatermarkEmitter};
use std::time::Duration;
use tracing::debug;

/// Result of a watermark-bracketed row fetch.
#[derive(Debug)]
pub struct BracketedFetch {
    /// Rows in cursor order, already filtered for the consumer.
    pub messages: Vec<RowMessage>,
    /// WAL write position observed during the fetch window.
    pub approximate_lsn: Lsn,
}

/// Stage one: scan a page of primary keys.
pub async fn scan_pk_page(
    db: &dyn SourceDb,
    table: TableOid,
    cursor: &Cursor,
    page_size: usize,
    include_min: bool,
    query_timeout: Duration,
) -> Result<PkScanPage> {
    run_with_timeout(
        db.scan_pks(table, cursor, page_size, include_min),
        page_size,
        query_timeout,
    )
    .await
}

/// Stage two: fetch rows under a watermark bracket.
///
/// The low watermark is written before the row query and the high
/// watermark after it, so every CDC event for a row in this window is
/// either applied to the PK index before the pipeline's `flush_batch`
/// arrives, or strictly supersedes the snapshot row.
#[allow(clippy::too_many_arguments)]
pub async fn fetch_rows_bracketed(
    db: &dyn SourceDb,
    watermarks: &dyn WatermarkEmitter,
    backfill_id: BackfillId,
    batch_id: BatchId,
    consumer: ConsumerId,
    table: TableOid,
    cursor: &Cursor,
    page_size: usize,
    include_min: bool,
    query_timeout: Duration,
) -> Result<BracketedFetch> {
    watermarks
        .emit_low_watermark(backfill_id, batch_id, table)
        .await?;

    let messages = run_with_timeout(
        db.fetch_rows(consumer, table, cursor, page_size, include_min),
        page_size,
        query_timeout,
    )
    .await?;

    let approximate_lsn = db.current_wal_lsn().await?;

    watermarks
        .emit_high_watermark(backfill_id, batch_id, table)
        .await?;

    debug!(
        %batch_id,
        rows = messages.len(),
        %approximate_lsn,
        "row fetch bracketed"
    );

    Ok(BracketedFetch {
        messages,
        approximate_lsn,
    })
}

async fn run_with_timeout<T>(
    query: impl std::future::Future<Output = Result<T>>,
    page_size: usize,
    query_timeout: Duration,
) -> Result<T> {
    match tokio::time::timeout(query_timeout, query).await {
        Ok(result) => result,
        Err(_) => Err(BackfillError::QueryTimeout {
            page_size,
            elapsed_ms: query_timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::KeyValue;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct SlowDb {
        delay: Duration,
    }

    #[async_trait]
    impl SourceDb for SlowDb {
        async fn scan_pks(
            &self,
            _table: TableOid,
            _cursor: &Cursor,
            _limit: usize,
            _include_min: bool,
        ) -> Result<PkScanPage> {
            tokio::time::sleep(self.delay).await;
            Ok(PkScanPage {
                pks: vec![],
                next_cursor: None,
            })
        }

        async fn fetch_rows(
            &self,
            _consumer: ConsumerId,
            _table: TableOid,
            _cursor: &Cursor,
            _limit: usize,
            _include_min: bool,
        ) -> Result<Vec<RowMessage>> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![])
        }

        async fn current_wal_lsn(&self) -> Result<Lsn> {
            Ok(Lsn(7))
        }

        async fn fetch_slot_lsn(&self, _slot_name: &str) -> Result<Lsn> {
            Ok(Lsn(7))
        }
    }

    #[derive(Default)]
    struct RecordingEmitter {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl WatermarkEmitter for RecordingEmitter {
        async fn emit_low_watermark(
            &self,
            _backfill_id: BackfillId,
            _batch_id: BatchId,
            _table: TableOid,
        ) -> Result<()> {
            self.events.lock().unwrap().push("low");
            Ok(())
        }

        async fn emit_high_watermark(
            &self,
            _backfill_id: BackfillId,
            _batch_id: BatchId,
            _table: TableOid,
        ) -> Result<()> {
            self.events.lock().unwrap().push("high");
            Ok(())
        }
    }

    fn cursor() -> Cursor {
        Cursor::new(vec![KeyValue::Int(0)])
    }

    #[tokio::test]
    async fn scan_times_out_with_typed_error() {
        let db = SlowDb {
            delay: Duration::from_secs(60),
        };
        let err = scan_pk_page(
            &db,
            TableOid(1),
            &cursor(),
            500,
            false,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        match err {
            BackfillError::QueryTimeout { page_size, .. } => assert_eq!(page_size, 500),
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn bracket_emits_low_then_high() {
        let db = SlowDb {
            delay: Duration::from_millis(1),
        };
        let emitter = RecordingEmitter::default();
        let out = fetch_rows_bracketed(
            &db,
            &emitter,
            BackfillId::generate(),
            BatchId::generate(),
            ConsumerId::generate(),
            TableOid(1),
            &cursor(),
            100,
            true,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(out.approximate_lsn, Lsn(7));
        assert_eq!(emitter.events.lock().unwrap().as_slice(), &["low", "high"]);
    }

    #[tokio::test]
    async fn timed_out_fetch_skips_high_watermark() {
        let db = SlowDb {
            delay: Duration::from_secs(60),
        };
        let emitter = RecordingEmitter::default();
        let err = fetch_rows_bracketed(
            &db,
            &emitter,
            BackfillId::generate(),
            BatchId::generate(),
            ConsumerId::generate(),
            TableOid(1),
            &cursor(),
            100,
            false,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackfillError::QueryTimeout { .. }));
        assert_eq!(emitter.events.lock().unwrap().as_slice(), &["low"]);
    }
}
