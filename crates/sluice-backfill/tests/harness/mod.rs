//! Test harness for table-reader scenario tests
//!
//! In-memory fakes for every port the reader consumes: a scripted
//! source database, a recording watermark emitter, an SMS with
//! toggleable persistence/failure behavior, and a backfill store that
//! captures cursor and counter writes. No database required.

// Each test binary compiles its own copy; not every binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use sluice_backfill::{
    BackfillError, BackfillId, BackfillRecord, BackfillStore, BatchId, BatchesChangedHub,
    ConsumerId, Cursor, KeyValue, Lsn, PkIndexRegistry, PkScanPage, PkTuple, ProgressDelta,
    ReaderDeps, Result, RowMessage, SlotMessageStore, SourceDb, TableOid, TableReaderConfig,
    WatermarkEmitter,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::time::{sleep, Instant};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent).
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("sluice_backfill=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Single-column integer PK.
pub fn pk(n: i64) -> PkTuple {
    PkTuple::new(vec![KeyValue::Int(n)])
}

/// Single-column integer cursor.
pub fn cur(n: i64) -> Cursor {
    Cursor::new(vec![KeyValue::Int(n)])
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until(deadline_ms: u64, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ----------------------------------------------------------------------
// Source database
// ----------------------------------------------------------------------

type RowPredicate = Box<dyn Fn(&PkTuple) -> bool + Send + Sync>;

/// Scripted source table: ordered rows, optional per-call errors,
/// artificial latency, and a consumer-filter predicate.
#[derive(Default)]
pub struct FakeSourceDb {
    rows: Mutex<BTreeMap<PkTuple, serde_json::Value>>,
    /// Recorded `(limit, include_min)` per scan call, errored calls included.
    pub scan_calls: Mutex<Vec<(usize, bool)>>,
    pub fetch_calls: Mutex<Vec<usize>>,
    scan_errors: Mutex<VecDeque<BackfillError>>,
    fetch_errors: Mutex<VecDeque<BackfillError>>,
    scan_delay: Mutex<Duration>,
    fetch_delay: Mutex<Duration>,
    row_predicate: Mutex<Option<RowPredicate>>,
    pub wal_lsn: AtomicU64,
    pub slot_lsn: AtomicU64,
    pub slot_missing: AtomicBool,
}

impl FakeSourceDb {
    pub fn with_rows(pks: &[i64]) -> Self {
        let db = Self::default();
        {
            let mut rows = db.rows.lock().unwrap();
            for &n in pks {
                rows.insert(pk(n), serde_json::json!({ "id": n }));
            }
        }
        db.wal_lsn.store(100, Ordering::SeqCst);
        db.slot_lsn.store(50, Ordering::SeqCst);
        db
    }

    pub fn inject_scan_error(&self, err: BackfillError) {
        self.scan_errors.lock().unwrap().push_back(err);
    }

    pub fn inject_fetch_error(&self, err: BackfillError) {
        self.fetch_errors.lock().unwrap().push_back(err);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    /// Rows failing the predicate are filtered out of `fetch_rows`.
    pub fn set_row_predicate(&self, predicate: impl Fn(&PkTuple) -> bool + Send + Sync + 'static) {
        *self.row_predicate.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn scan_count(&self) -> usize {
        self.scan_calls.lock().unwrap().len()
    }

    fn page(&self, cursor: &Cursor, limit: usize, include_min: bool) -> Vec<PkTuple> {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|key| {
                if include_min {
                    key.values() >= cursor.values()
                } else {
                    key.values() > cursor.values()
                }
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SourceDb for FakeSourceDb {
    async fn scan_pks(
        &self,
        _table: TableOid,
        cursor: &Cursor,
        limit: usize,
        include_min: bool,
    ) -> Result<PkScanPage> {
        self.scan_calls.lock().unwrap().push((limit, include_min));
        if let Some(err) = self.scan_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let delay = *self.scan_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let pks = self.page(cursor, limit, include_min);
        let next_cursor = pks.last().map(|last| Cursor::new(last.values().to_vec()));
        Ok(PkScanPage { pks, next_cursor })
    }

    async fn fetch_rows(
        &self,
        _consumer: ConsumerId,
        _table: TableOid,
        cursor: &Cursor,
        limit: usize,
        include_min: bool,
    ) -> Result<Vec<RowMessage>> {
        self.fetch_calls.lock().unwrap().push(limit);
        if let Some(err) = self.fetch_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let page = self.page(cursor, limit, include_min);
        let rows = self.rows.lock().unwrap();
        let predicate = self.row_predicate.lock().unwrap();
        Ok(page
            .into_iter()
            .filter(|key| predicate.as_ref().map(|p| p(key)).unwrap_or(true))
            .map(|key| {
                let record = rows.get(&key).cloned().unwrap_or(serde_json::Value::Null);
                RowMessage::new(key, record)
            })
            .collect())
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        Ok(Lsn(self.wal_lsn.load(Ordering::SeqCst)))
    }

    async fn fetch_slot_lsn(&self, slot_name: &str) -> Result<Lsn> {
        if self.slot_missing.load(Ordering::SeqCst) {
            return Err(BackfillError::SlotNotFound(slot_name.to_string()));
        }
        Ok(Lsn(self.slot_lsn.load(Ordering::SeqCst)))
    }
}

// ----------------------------------------------------------------------
// Watermark emitter
// ----------------------------------------------------------------------

/// Records every watermark in emission order.
#[derive(Default)]
pub struct FakeWatermarks {
    pub lows: Mutex<Vec<BatchId>>,
    pub highs: Mutex<Vec<BatchId>>,
}

impl FakeWatermarks {
    pub fn high_count(&self) -> usize {
        self.highs.lock().unwrap().len()
    }

    pub fn low_at(&self, idx: usize) -> Option<BatchId> {
        self.lows.lock().unwrap().get(idx).copied()
    }

    pub fn high_at(&self, idx: usize) -> Option<BatchId> {
        self.highs.lock().unwrap().get(idx).copied()
    }
}

#[async_trait]
impl WatermarkEmitter for FakeWatermarks {
    async fn emit_low_watermark(
        &self,
        _backfill_id: BackfillId,
        batch_id: BatchId,
        _table: TableOid,
    ) -> Result<()> {
        self.lows.lock().unwrap().push(batch_id);
        Ok(())
    }

    async fn emit_high_watermark(
        &self,
        _backfill_id: BackfillId,
        batch_id: BatchId,
        _table: TableOid,
    ) -> Result<()> {
        self.highs.lock().unwrap().push(batch_id);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Slot message store
// ----------------------------------------------------------------------

/// SMS fake: records pushes, reports unpersisted ids until a test marks
/// them persisted, and injects failures on demand.
#[derive(Default)]
pub struct FakeSms {
    pub pushes: Mutex<Vec<(BatchId, Vec<RowMessage>)>>,
    persisted: Mutex<HashSet<BatchId>>,
    pub pending: AtomicU64,
    payload_too_large_times: AtomicU32,
    fatal_push: AtomicBool,
    down: AtomicBool,
}

impl FakeSms {
    pub fn mark_persisted(&self, batch_id: BatchId) {
        self.persisted.lock().unwrap().insert(batch_id);
    }

    pub fn fail_pushes_payload_too_large(&self, times: u32) {
        self.payload_too_large_times.store(times, Ordering::SeqCst);
    }

    pub fn fail_pushes_fatal(&self) {
        self.fatal_push.store(true, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    /// PKs pushed for a batch, in delivery order.
    pub fn pushed_pks(&self, batch_id: BatchId) -> Vec<PkTuple> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == batch_id)
            .map(|(_, msgs)| msgs.iter().map(|m| m.pk.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SlotMessageStore for FakeSms {
    async fn put_batch(
        &self,
        _consumer: ConsumerId,
        batch_id: BatchId,
        messages: Vec<RowMessage>,
    ) -> Result<()> {
        if self.fatal_push.load(Ordering::SeqCst) {
            return Err(BackfillError::sms_fatal("injected failure"));
        }
        if self.payload_too_large_times.load(Ordering::SeqCst) > 0 {
            self.payload_too_large_times.fetch_sub(1, Ordering::SeqCst);
            return Err(BackfillError::SmsPayloadTooLarge { batch_id });
        }
        self.pushes.lock().unwrap().push((batch_id, messages));
        Ok(())
    }

    async fn unpersisted_batch_ids(
        &self,
        _consumer: ConsumerId,
        batch_ids: &[BatchId],
    ) -> Result<Vec<BatchId>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackfillError::sms_down("injected outage"));
        }
        let persisted = self.persisted.lock().unwrap();
        Ok(batch_ids
            .iter()
            .copied()
            .filter(|id| !persisted.contains(id))
            .collect())
    }

    async fn count_messages(&self, _consumer: ConsumerId) -> Result<u64> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackfillError::sms_down("injected outage"));
        }
        Ok(self.pending.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------
// Backfill store
// ----------------------------------------------------------------------

/// Registry fake capturing cursor and counter writes.
pub struct FakeStore {
    record: Mutex<BackfillRecord>,
    active: AtomicBool,
    consumer_missing: AtomicBool,
    cursor: Mutex<Option<Cursor>>,
    pub cursor_updates: Mutex<Vec<Cursor>>,
    cursor_deleted: AtomicBool,
    finished_count: AtomicU32,
    counters: Mutex<ProgressDelta>,
}

impl FakeStore {
    pub fn new(record: BackfillRecord) -> Self {
        Self {
            record: Mutex::new(record),
            active: AtomicBool::new(true),
            consumer_missing: AtomicBool::new(false),
            cursor: Mutex::new(None),
            cursor_updates: Mutex::new(Vec::new()),
            cursor_deleted: AtomicBool::new(false),
            finished_count: AtomicU32::new(0),
            counters: Mutex::new(ProgressDelta::default()),
        }
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn drop_consumer(&self) {
        self.consumer_missing.store(true, Ordering::SeqCst);
    }

    pub fn set_persisted_cursor(&self, cursor: Cursor) {
        *self.cursor.lock().unwrap() = Some(cursor);
    }

    pub fn cursor_deleted(&self) -> bool {
        self.cursor_deleted.load(Ordering::SeqCst)
    }

    pub fn finished_count(&self) -> u32 {
        self.finished_count.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> ProgressDelta {
        *self.counters.lock().unwrap()
    }
}

#[async_trait]
impl BackfillStore for FakeStore {
    async fn fetch_backfill(&self, _id: BackfillId) -> Result<BackfillRecord> {
        let record = self.record.lock().unwrap().clone();
        if self.consumer_missing.load(Ordering::SeqCst) {
            return Err(BackfillError::ConsumerMissing(record.consumer_id));
        }
        Ok(BackfillRecord {
            active: self.active.load(Ordering::SeqCst),
            ..record
        })
    }

    async fn fetch_cursor(&self, _id: BackfillId) -> Result<Option<Cursor>> {
        Ok(self.cursor.lock().unwrap().clone())
    }

    async fn update_cursor(&self, _id: BackfillId, cursor: &Cursor) -> Result<()> {
        *self.cursor.lock().unwrap() = Some(cursor.clone());
        self.cursor_updates.lock().unwrap().push(cursor.clone());
        Ok(())
    }

    async fn delete_cursor(&self, _id: BackfillId) -> Result<()> {
        *self.cursor.lock().unwrap() = None;
        self.cursor_deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn backfill_finished(&self, _id: BackfillId, _consumer: ConsumerId) -> Result<()> {
        self.finished_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_counters(&self, _id: BackfillId, delta: ProgressDelta) -> Result<()> {
        let mut counters = self.counters.lock().unwrap();
        counters.rows_processed += delta.rows_processed;
        counters.rows_ingested += delta.rows_ingested;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Rig
// ----------------------------------------------------------------------

/// Everything one scenario needs, wired together.
///
/// `registry` is the process-global PK index registry the worker
/// registers into; each rig's random consumer id keeps parallel tests
/// isolated within it.
pub struct TestRig {
    pub backfill_id: BackfillId,
    pub consumer_id: ConsumerId,
    pub table: TableOid,
    pub db: Arc<FakeSourceDb>,
    pub watermarks: Arc<FakeWatermarks>,
    pub sms: Arc<FakeSms>,
    pub store: Arc<FakeStore>,
    pub registry: &'static PkIndexRegistry,
    pub hub: Arc<BatchesChangedHub>,
}

impl TestRig {
    /// Rig with the given integer PKs and a minimum cursor.
    pub fn new(rows: &[i64], min_cursor: i64) -> Self {
        init_test_logging();
        let backfill_id = BackfillId::generate();
        let consumer_id = ConsumerId::generate();
        let table = TableOid(16384);
        let record = BackfillRecord {
            id: backfill_id,
            consumer_id,
            table_oid: table,
            slot_name: "sluice_slot".to_string(),
            initial_min_cursor: cur(min_cursor),
            active: true,
            updated_at: Utc::now(),
        };
        Self {
            backfill_id,
            consumer_id,
            table,
            db: Arc::new(FakeSourceDb::with_rows(rows)),
            watermarks: Arc::new(FakeWatermarks::default()),
            sms: Arc::new(FakeSms::default()),
            store: Arc::new(FakeStore::new(record)),
            registry: PkIndexRegistry::global(),
            hub: Arc::new(BatchesChangedHub::new()),
        }
    }

    pub fn deps(&self) -> ReaderDeps {
        ReaderDeps {
            db: self.db.clone(),
            watermarks: self.watermarks.clone(),
            sms: self.sms.clone(),
            store: self.store.clone(),
            hub: self.hub.clone(),
        }
    }

    /// Config with test-friendly short periodic intervals.
    pub fn config(&self) -> TableReaderConfig {
        TableReaderConfig::builder(self.backfill_id, self.table)
            .check_state_timeout_ms(100)
            .check_sms_timeout_ms(50)
            .build()
            .unwrap()
    }

    /// Mark a batch persisted and fire the batches-changed signal.
    pub fn persist(&self, batch_id: BatchId) {
        self.sms.mark_persisted(batch_id);
        self.hub.notify(self.consumer_id);
    }
}
