//! The table-reader state machine
//!
//! One worker per active backfill. All mutable state is owned by a
//! single task; peers talk to it through a command mailbox, and the
//! two fetch stages run as spawned tasks that report back through an
//! internal event channel so the mailbox stays responsive. The only
//! state shared outside the owner is the PK index, which is
//! concurrency-safe on its own.
//!
//! ## Lifecycle
//!
//! ```text
//!  spawn ──► initialize (load backfill, register PK index, resume cursor)
//!        ──► run loop:
//!              maybe_fetch      every event + 1s tick
//!              check_state      every 30s   (deactivation, backpressure, staleness)
//!              check_sms        every 5s + batches-changed notification
//!              process_logging  every 30s
//!        ──► stop: Finished | Deactivated | ConsumerMissing | SmsDown
//!                  | StaleBatch | Fatal
//! ```

use crate::batch::{Batch, BatchQueues};
use crate::config::TableReaderConfig;
use crate::cursor::{Cursor, PkTuple};
use crate::error::{BackfillError, Result, StopReason};
use crate::fetch::{self, BracketedFetch};
use crate::message::{BackfillId, BatchId, ConsumerId, Lsn};
use crate::metrics::ReaderMetrics;
use crate::notify::BatchesChangedHub;
use crate::page_size::PageSizeOptimizer;
use crate::pk_index::{BatchPkIndex, PkIndexRegistry};
use crate::sms::{push_with_retry, SlotMessageStore, SmsRetryPolicy};
use crate::source::{PkScanPage, SourceDb, WatermarkEmitter};
use crate::store::{BackfillRecord, BackfillStore, ProgressDelta};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Fetch backoff after failures: base 1s, doubling, capped at 5 min.
const FETCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const FETCH_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Delay before re-delivering a flush that raced its row fetch.
const FLUSH_DEFER_DELAY: Duration = Duration::from_millis(1);

/// Cadence of the periodic metrics log line.
const PROCESS_LOGGING_INTERVAL: Duration = Duration::from_secs(30);

/// External collaborators of one worker.
///
/// The PK index is not injected here: workers register it in
/// [`PkIndexRegistry::global`], the one process-wide handle the CDC
/// event path resolves `pks_seen` against without touching any
/// worker's mailbox.
#[derive(Clone)]
pub struct ReaderDeps {
    pub db: Arc<dyn SourceDb>,
    pub watermarks: Arc<dyn WatermarkEmitter>,
    pub sms: Arc<dyn SlotMessageStore>,
    pub store: Arc<dyn BackfillStore>,
    pub hub: Arc<BatchesChangedHub>,
}

/// Commands accepted from peers. All are acknowledged OK; errors are
/// internalized into the worker's stop reason.
enum Command {
    FlushBatch {
        batch_id: BatchId,
        commit_lsn: Lsn,
        ack: oneshot::Sender<()>,
    },
    DropPks {
        pks: Vec<PkTuple>,
        ack: oneshot::Sender<()>,
    },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchStage {
    PkScan,
    RowFetch,
}

/// Results delivered from spawned fetch tasks.
enum TaskEvent {
    PkScanDone {
        task_ref: Uuid,
        batch_id: BatchId,
        result: Result<PkScanPage>,
        elapsed_ms: u64,
    },
    RowFetchDone {
        task_ref: Uuid,
        batch_id: BatchId,
        result: Result<BracketedFetch>,
        elapsed_ms: u64,
    },
    TaskCrashed {
        task_ref: Uuid,
        stage: FetchStage,
        batch_id: BatchId,
    },
}

/// Bookkeeping for one in-flight fetch task.
struct FetchTask {
    task_ref: Uuid,
    batch_id: BatchId,
    page_size: usize,
    include_min: bool,
    started_at: Instant,
}

/// Client handle to a running table reader.
#[derive(Debug)]
pub struct TableReaderHandle {
    backfill_id: BackfillId,
    consumer_id: ConsumerId,
    cmd_tx: mpsc::Sender<Command>,
    join: JoinHandle<StopReason>,
}

impl TableReaderHandle {
    pub fn backfill_id(&self) -> BackfillId {
        self.backfill_id
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// Deliver a flush for a batch. Always acknowledged OK; a worker
    /// that already stopped is treated as a late delivery.
    pub async fn flush_batch(&self, batch_id: BatchId, commit_lsn: Lsn) {
        let (ack, done) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::FlushBatch {
                batch_id,
                commit_lsn,
                ack,
            })
            .await
            .is_err()
        {
            debug!(%batch_id, "flush_batch after worker stop, acknowledged");
            return;
        }
        let _ = done.await;
    }

    /// Remove PKs from every in-flight batch. Synchronous.
    pub async fn drop_pks(&self, pks: Vec<PkTuple>) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Command::DropPks { pks, ack }).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Request a normal stop.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// Wait for the worker to exit and return why.
    pub async fn await_stopped(self) -> StopReason {
        self.join.await.unwrap_or_else(|_| {
            StopReason::Fatal(BackfillError::invalid_state("reader task panicked"))
        })
    }
}

/// The per-backfill worker.
pub struct TableReader {
    config: TableReaderConfig,
    deps: ReaderDeps,
    record: BackfillRecord,
    pk_index: Arc<BatchPkIndex>,

    cursor: Cursor,
    /// Cursor returned by the PK scan, applied once the row fetch lands.
    next_cursor: Option<Cursor>,
    /// Whether any page was scanned this run. The first scan of a run
    /// starting at the configured minimum is inclusive of it; scans
    /// after a page has been applied are always exclusive, even if the
    /// advanced cursor compares equal to the minimum.
    scanned_any: bool,
    done_fetching: bool,

    queues: BatchQueues,
    ignorable: HashSet<BatchId>,

    pk_scan_task: Option<FetchTask>,
    row_fetch_task: Option<FetchTask>,
    /// Stage-one elapsed time of the batch currently in stage two.
    last_pk_scan_ms: u64,

    optimizer: PageSizeOptimizer,
    successive_failures: u32,
    last_fetch_request_at: Option<Instant>,
    /// Pending-message count sampled from the SMS by `check_state`.
    sms_pending: u64,

    metrics: ReaderMetrics,
    retry_policy: SmsRetryPolicy,

    cmd_tx: mpsc::Sender<Command>,
    task_tx: mpsc::Sender<TaskEvent>,
}

impl TableReader {
    /// Initialize and spawn a worker for the configured backfill.
    ///
    /// Loads the backfill record, registers the public PK index under
    /// the consumer id (idempotent), subscribes to batches-changed
    /// notifications, and resumes from the persisted cursor when one
    /// exists.
    pub async fn spawn(config: TableReaderConfig, deps: ReaderDeps) -> Result<TableReaderHandle> {
        config.validate()?;

        let record = deps.store.fetch_backfill(config.backfill_id).await?;
        if !record.active {
            return Err(BackfillError::BackfillDeactivated(record.id));
        }

        let consumer_id = record.consumer_id;
        let pk_index = PkIndexRegistry::global().register(consumer_id);
        let batches_rx = deps.hub.subscribe(consumer_id);

        let cursor = deps
            .store
            .fetch_cursor(config.backfill_id)
            .await?
            .unwrap_or_else(|| record.initial_min_cursor.clone());

        info!(
            backfill_id = %config.backfill_id,
            consumer_id = %consumer_id,
            table_oid = %config.table_oid,
            %cursor,
            "table reader starting"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (task_tx, task_rx) = mpsc::channel(8);

        let optimizer = PageSizeOptimizer::new(
            config.initial_page_size,
            config.max_timeout_ms,
            config.max_page_size,
        );
        let retry_policy = SmsRetryPolicy {
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_backoff_time: Duration::from_millis(config.max_backoff_time_ms),
        };

        let reader = TableReader {
            queues: BatchQueues::new(config.max_batches_in_memory),
            config,
            deps,
            record,
            pk_index,
            cursor,
            next_cursor: None,
            scanned_any: false,
            done_fetching: false,
            ignorable: HashSet::new(),
            pk_scan_task: None,
            row_fetch_task: None,
            last_pk_scan_ms: 0,
            optimizer,
            successive_failures: 0,
            last_fetch_request_at: None,
            sms_pending: 0,
            metrics: ReaderMetrics::new(),
            retry_policy,
            cmd_tx: cmd_tx.clone(),
            task_tx,
        };

        let backfill_id = reader.config.backfill_id;
        let join = tokio::spawn(reader.run(cmd_rx, task_rx, batches_rx));

        Ok(TableReaderHandle {
            backfill_id,
            consumer_id,
            cmd_tx,
            join,
        })
    }

    async fn run(
        mut self,
        cmd_rx: mpsc::Receiver<Command>,
        task_rx: mpsc::Receiver<TaskEvent>,
        batches_rx: broadcast::Receiver<()>,
    ) -> StopReason {
        let consumer_id = self.record.consumer_id;
        let reason = self.run_loop(cmd_rx, task_rx, batches_rx).await;

        PkIndexRegistry::global().release(consumer_id);
        self.deps.hub.release(consumer_id);

        if reason.is_normal() {
            info!(backfill_id = %self.config.backfill_id, ?reason, "table reader stopped");
        } else {
            error!(backfill_id = %self.config.backfill_id, ?reason, "table reader stopped");
        }
        reason
    }

    async fn run_loop(
        &mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut task_rx: mpsc::Receiver<TaskEvent>,
        mut batches_rx: broadcast::Receiver<()>,
    ) -> StopReason {
        // Seed the backpressure sample before the first fetch.
        match self.deps.sms.count_messages(self.record.consumer_id).await {
            Ok(n) => self.sms_pending = n,
            Err(err) => {
                warn!(%err, "SMS unreachable at startup");
                return StopReason::SmsDown;
            }
        }

        let now = Instant::now();
        let mut fetch_tick = interval_at(now + Duration::from_secs(1), Duration::from_secs(1));
        let mut check_state_tick = interval_at(
            now + self.config.check_state_interval(),
            self.config.check_state_interval(),
        );
        let mut check_sms_tick = interval_at(
            now + self.config.check_sms_interval(),
            self.config.check_sms_interval(),
        );
        let mut log_tick = interval_at(
            now + PROCESS_LOGGING_INTERVAL,
            PROCESS_LOGGING_INTERVAL,
        );

        loop {
            self.maybe_fetch();

            let stop = tokio::select! {
                Some(cmd) = cmd_rx.recv() => match cmd {
                    Command::FlushBatch { batch_id, commit_lsn, ack } => {
                        self.on_flush_batch(batch_id, commit_lsn, ack).await
                    }
                    Command::DropPks { pks, ack } => {
                        self.on_drop_pks(&pks);
                        let _ = ack.send(());
                        None
                    }
                    Command::Stop => {
                        info!(backfill_id = %self.config.backfill_id, "stop requested");
                        Some(StopReason::Deactivated)
                    }
                },
                Some(event) = task_rx.recv() => self.on_task_event(event).await,
                _ = fetch_tick.tick() => None,
                _ = check_state_tick.tick() => self.check_state().await,
                _ = check_sms_tick.tick() => self.check_sms().await,
                () = recv_notification(&mut batches_rx) => self.check_sms().await,
                _ = log_tick.tick() => {
                    self.log_status();
                    None
                }
            };

            if let Some(reason) = stop {
                return reason;
            }
        }
    }

    // ------------------------------------------------------------------
    // Fetch scheduling
    // ------------------------------------------------------------------

    fn should_fetch(&self) -> bool {
        !self.done_fetching
            && self.backoff_elapsed()
            && self.sms_pending < self.config.max_pending_messages
            && self.queues.has_capacity()
            && self.pk_scan_task.is_none()
            && self.row_fetch_task.is_none()
    }

    fn backoff_elapsed(&self) -> bool {
        if self.successive_failures == 0 {
            return true;
        }
        match self.last_fetch_request_at {
            Some(last) => last.elapsed() >= fetch_backoff(self.successive_failures),
            None => true,
        }
    }

    /// Launch a PK scan when the predicate allows one.
    fn maybe_fetch(&mut self) {
        if !self.should_fetch() {
            return;
        }

        let batch_id = BatchId::generate();
        let task_ref = Uuid::new_v4();
        let page_size = self.optimizer.size();
        let include_min = !self.scanned_any && self.cursor == self.record.initial_min_cursor;

        self.last_fetch_request_at = Some(Instant::now());

        let db = self.deps.db.clone();
        let table = self.config.table_oid;
        let cursor = self.cursor.clone();
        let query_timeout = self.config.query_timeout();
        let task_tx = self.task_tx.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result =
                fetch::scan_pk_page(&*db, table, &cursor, page_size, include_min, query_timeout)
                    .await;
            (result, started.elapsed().as_millis() as u64)
        });
        monitor_task(handle, task_tx, task_ref, batch_id, FetchStage::PkScan, move |(result, elapsed_ms)| {
            TaskEvent::PkScanDone {
                task_ref,
                batch_id,
                result,
                elapsed_ms,
            }
        });

        debug!(%batch_id, page_size, include_min, cursor = %self.cursor, "pk scan launched");
        self.pk_scan_task = Some(FetchTask {
            task_ref,
            batch_id,
            page_size,
            include_min,
            started_at: Instant::now(),
        });
    }

    fn launch_row_fetch(&mut self, batch_id: BatchId, page_size: usize, include_min: bool) {
        let task_ref = Uuid::new_v4();
        let db = self.deps.db.clone();
        let watermarks = self.deps.watermarks.clone();
        let backfill_id = self.config.backfill_id;
        let consumer = self.record.consumer_id;
        let table = self.config.table_oid;
        let cursor = self.cursor.clone();
        let query_timeout = self.config.query_timeout();
        let task_tx = self.task_tx.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result = fetch::fetch_rows_bracketed(
                &*db,
                &*watermarks,
                backfill_id,
                batch_id,
                consumer,
                table,
                &cursor,
                page_size,
                include_min,
                query_timeout,
            )
            .await;
            (result, started.elapsed().as_millis() as u64)
        });
        monitor_task(handle, task_tx, task_ref, batch_id, FetchStage::RowFetch, move |(result, elapsed_ms)| {
            TaskEvent::RowFetchDone {
                task_ref,
                batch_id,
                result,
                elapsed_ms,
            }
        });

        debug!(%batch_id, page_size, "row fetch launched");
        self.row_fetch_task = Some(FetchTask {
            task_ref,
            batch_id,
            page_size,
            include_min,
            started_at: Instant::now(),
        });
    }

    // ------------------------------------------------------------------
    // Task results
    // ------------------------------------------------------------------

    async fn on_task_event(&mut self, event: TaskEvent) -> Option<StopReason> {
        match event {
            TaskEvent::PkScanDone {
                task_ref,
                batch_id,
                result,
                elapsed_ms,
            } => {
                let matches = self
                    .pk_scan_task
                    .as_ref()
                    .map(|t| t.task_ref == task_ref)
                    .unwrap_or(false);
                if !matches {
                    debug!(%batch_id, "stray pk scan result discarded");
                    return None;
                }
                let task = self.pk_scan_task.take().expect("checked above");
                self.on_pk_scan_done(task, batch_id, result, elapsed_ms).await
            }
            TaskEvent::RowFetchDone {
                task_ref,
                batch_id,
                result,
                elapsed_ms,
            } => {
                let matches = self
                    .row_fetch_task
                    .as_ref()
                    .map(|t| t.task_ref == task_ref)
                    .unwrap_or(false);
                if !matches {
                    debug!(%batch_id, "stray row fetch result discarded");
                    return None;
                }
                let task = self.row_fetch_task.take().expect("checked above");
                self.on_row_fetch_done(task, batch_id, result, elapsed_ms)
            }
            TaskEvent::TaskCrashed {
                task_ref,
                stage,
                batch_id,
            } => {
                let lived_ms = match stage {
                    FetchStage::PkScan => {
                        match &self.pk_scan_task {
                            Some(task) if task.task_ref == task_ref => {
                                let lived = task.started_at.elapsed();
                                self.pk_scan_task = None;
                                lived.as_millis() as u64
                            }
                            _ => return None,
                        }
                    }
                    FetchStage::RowFetch => {
                        match &self.row_fetch_task {
                            Some(task) if task.task_ref == task_ref => {
                                let lived = task.started_at.elapsed();
                                self.row_fetch_task = None;
                                self.pk_index.delete(batch_id);
                                self.next_cursor = None;
                                lived.as_millis() as u64
                            }
                            _ => return None,
                        }
                    }
                };
                warn!(%batch_id, ?stage, lived_ms, "fetch task crashed");
                self.successive_failures += 1;
                self.metrics.record_transient_error();
                None
            }
        }
    }

    async fn on_pk_scan_done(
        &mut self,
        task: FetchTask,
        batch_id: BatchId,
        result: Result<PkScanPage>,
        elapsed_ms: u64,
    ) -> Option<StopReason> {
        match result {
            Ok(page) if page.is_empty() => {
                if self.queues.is_empty() {
                    return self.finish().await;
                }
                info!(%batch_id, "table exhausted, draining in-flight batches");
                self.done_fetching = true;
                self.ignorable.insert(batch_id);
                None
            }
            Ok(page) => {
                debug!(%batch_id, pks = page.pks.len(), elapsed_ms, "pk scan complete");
                self.pk_index.add(batch_id, page.pks);
                self.last_pk_scan_ms = elapsed_ms;
                self.next_cursor = page.next_cursor;
                self.launch_row_fetch(batch_id, task.page_size, task.include_min);
                None
            }
            Err(BackfillError::QueryTimeout { .. }) => {
                warn!(%batch_id, page_size = task.page_size, "pk scan timed out");
                self.optimizer.record_timeout(task.page_size);
                self.metrics.record_fetch_timeout();
                None
            }
            Err(err) => {
                self.successive_failures += 1;
                self.metrics.record_transient_error();
                warn!(
                    %batch_id,
                    %err,
                    category = err.category().as_str(),
                    failures = self.successive_failures,
                    "pk scan failed"
                );
                None
            }
        }
    }

    fn on_row_fetch_done(
        &mut self,
        task: FetchTask,
        batch_id: BatchId,
        result: Result<BracketedFetch>,
        elapsed_ms: u64,
    ) -> Option<StopReason> {
        match result {
            Ok(fetched) => {
                // Tune on the bottleneck stage, never the faster leg.
                let slower = self.last_pk_scan_ms.max(elapsed_ms).max(1);
                self.optimizer.record_timing(task.page_size, slower);
                self.metrics.record_fetch_ms(slower);

                let next_cursor = self.next_cursor.take();

                if fetched.messages.is_empty() {
                    debug!(%batch_id, "all rows filtered out, batch ignorable");
                    self.pk_index.delete(batch_id);
                    self.ignorable.insert(batch_id);
                    self.metrics.record_batch(0);
                } else {
                    let batch = Batch::new(
                        batch_id,
                        self.cursor.clone(),
                        fetched.approximate_lsn,
                        fetched.messages,
                    );
                    debug!(
                        %batch_id,
                        rows = batch.size,
                        lsn = %batch.approximate_lsn,
                        "batch fetched"
                    );
                    self.metrics.record_batch(batch.size as u64);
                    self.queues.push_unflushed(batch);
                }

                if let Some(next) = next_cursor {
                    self.cursor = next;
                }
                self.scanned_any = true;
                self.successive_failures = 0;
                None
            }
            Err(BackfillError::QueryTimeout { .. }) => {
                warn!(%batch_id, page_size = task.page_size, "row fetch timed out");
                self.optimizer.record_timeout(task.page_size);
                self.metrics.record_fetch_timeout();
                self.abandon_batch(batch_id);
                None
            }
            Err(err) => {
                self.successive_failures += 1;
                self.metrics.record_transient_error();
                warn!(
                    %batch_id,
                    %err,
                    category = err.category().as_str(),
                    failures = self.successive_failures,
                    "row fetch failed"
                );
                self.abandon_batch(batch_id);
                None
            }
        }
    }

    /// Discard a batch whose row fetch did not complete. The next fetch
    /// restarts from the unchanged cursor under a fresh batch id; a
    /// late flush for this id is handled as unknown.
    fn abandon_batch(&mut self, batch_id: BatchId) {
        self.pk_index.delete(batch_id);
        self.next_cursor = None;
    }

    // ------------------------------------------------------------------
    // Flush protocol
    // ------------------------------------------------------------------

    async fn on_flush_batch(
        &mut self,
        batch_id: BatchId,
        commit_lsn: Lsn,
        ack: oneshot::Sender<()>,
    ) -> Option<StopReason> {
        // The flush can outrun the row-fetch result that is already on
        // its way to the mailbox. Re-enqueue instead of blocking: the
        // fetch result may need this same mailbox to land.
        let row_fetch_in_flight = self
            .row_fetch_task
            .as_ref()
            .map(|t| t.batch_id == batch_id)
            .unwrap_or(false);
        if row_fetch_in_flight {
            debug!(%batch_id, "flush raced row fetch, deferring");
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                sleep(FLUSH_DEFER_DELAY).await;
                let _ = cmd_tx
                    .send(Command::FlushBatch {
                        batch_id,
                        commit_lsn,
                        ack,
                    })
                    .await;
            });
            return None;
        }

        if self.ignorable.remove(&batch_id) {
            debug!(%batch_id, "flush for ignorable batch acknowledged");
            self.pk_index.delete(batch_id);
            let _ = ack.send(());
            return None;
        }

        if self.queues.unflushed_is_empty() && !self.queues.contains_flushed(batch_id) {
            info!(%batch_id, "flush for unknown batch, acknowledged");
            let _ = ack.send(());
            return None;
        }

        if self.queues.contains_flushed(batch_id) {
            error!(%batch_id, "duplicate flush for already-pushed batch");
            let _ = ack.send(());
            return Some(StopReason::Fatal(BackfillError::invalid_state(format!(
                "duplicate flush for already-pushed batch {batch_id}"
            ))));
        }

        let head_id = self.queues.head_unflushed().map(|b| b.id);
        if head_id != Some(batch_id) {
            warn!(%batch_id, ?head_id, "out-of-order flush, acknowledged without flushing");
            let _ = ack.send(());
            return None;
        }

        let mut batch = self.queues.pop_unflushed_head().expect("head checked");
        let fetched = batch.messages.len();

        // Keep only rows CDC has not superseded since stage one.
        let mut survivors: Vec<_> = batch
            .messages
            .drain(..)
            .filter(|msg| self.pk_index.contains(batch_id, &msg.pk))
            .collect();
        self.pk_index.delete(batch_id);
        let filtered_out = (fetched - survivors.len()) as u64;

        if survivors.is_empty() {
            debug!(%batch_id, "every row superseded, batch committed in place");
            self.metrics.record_flush(0, filtered_out);
            if let Err(err) = self
                .deps
                .store
                .update_cursor(self.config.backfill_id, &batch.cursor)
                .await
            {
                let _ = ack.send(());
                return Some(StopReason::Fatal(err));
            }
            let _ = ack.send(());
            return self.maybe_finished().await;
        }

        for (idx, msg) in survivors.iter_mut().enumerate() {
            msg.stamp(commit_lsn, idx as u64);
        }
        let pushed = survivors.len() as u64;

        let push_result = push_with_retry(
            &*self.deps.sms,
            self.record.consumer_id,
            batch_id,
            survivors,
            self.retry_policy,
        )
        .await;

        match push_result {
            Ok(retries) => {
                info!(%batch_id, pushed, filtered_out, retries, "batch flushed to SMS");
                self.metrics.record_flush(pushed, filtered_out);
                self.metrics.record_sms_retries(retries as u64);
                batch.clear_messages();
                self.queues.push_flushed(batch);
                let _ = ack.send(());
                None
            }
            Err(err) => {
                error!(
                    %batch_id,
                    %err,
                    category = err.category().as_str(),
                    "SMS push failed, stopping"
                );
                let _ = ack.send(());
                Some(StopReason::Fatal(err))
            }
        }
    }

    fn on_drop_pks(&self, pks: &[PkTuple]) {
        debug!(count = pks.len(), "drop_pks");
        self.pk_index.remove_from_all(pks);
    }

    // ------------------------------------------------------------------
    // Periodic checks
    // ------------------------------------------------------------------

    /// Refresh the backfill record, sample SMS backpressure, and probe
    /// the slot for staleness.
    async fn check_state(&mut self) -> Option<StopReason> {
        match self.deps.store.fetch_backfill(self.config.backfill_id).await {
            Ok(record) => {
                if !record.active {
                    info!(backfill_id = %self.config.backfill_id, "backfill deactivated");
                    return Some(StopReason::Deactivated);
                }
                self.record = record;
            }
            Err(BackfillError::ConsumerMissing(consumer_id)) => {
                warn!(%consumer_id, "consumer missing");
                return Some(StopReason::ConsumerMissing);
            }
            Err(err) => {
                warn!(%err, category = err.category().as_str(), "backfill refresh failed, will retry");
            }
        }

        match self.deps.sms.count_messages(self.record.consumer_id).await {
            Ok(pending) => self.sms_pending = pending,
            Err(err) => {
                warn!(%err, "SMS pending-count probe failed");
                return Some(StopReason::SmsDown);
            }
        }

        match self.deps.db.fetch_slot_lsn(&self.record.slot_name).await {
            Ok(slot_lsn) => {
                let stale = self
                    .queues
                    .unflushed()
                    .find(|batch| batch.approximate_lsn < slot_lsn);
                if let Some(batch) = stale {
                    error!(
                        batch_id = %batch.id,
                        batch_lsn = %batch.approximate_lsn,
                        %slot_lsn,
                        "slot advanced past unflushed batch"
                    );
                    return Some(StopReason::StaleBatch {
                        batch_lsn: batch.approximate_lsn,
                        slot_lsn,
                    });
                }
            }
            Err(err @ BackfillError::SlotNotFound(_)) => {
                return Some(StopReason::Fatal(err));
            }
            Err(err) => {
                warn!(%err, category = err.category().as_str(), "slot lsn probe failed, will retry");
            }
        }

        None
    }

    /// Sweep the flushed queue against the SMS persistence report:
    /// batches no longer reported unpersisted are committed, their
    /// cursor persisted and counters updated, and they are dropped.
    async fn check_sms(&mut self) -> Option<StopReason> {
        let flushed_ids = self.queues.flushed_ids();
        if flushed_ids.is_empty() {
            return self.maybe_finished().await;
        }

        let unpersisted = match self
            .deps
            .sms
            .unpersisted_batch_ids(self.record.consumer_id, &flushed_ids)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(%err, "SMS persistence probe failed");
                return Some(StopReason::SmsDown);
            }
        };

        let committed = self.queues.take_committed(&unpersisted);
        if committed.is_empty() {
            return None;
        }

        let mut delta = ProgressDelta::default();
        for batch in &committed {
            if let Err(err) = self
                .deps
                .store
                .update_cursor(self.config.backfill_id, &batch.cursor)
                .await
            {
                return Some(StopReason::Fatal(err));
            }
            delta.rows_processed += batch.size as u64;
            delta.rows_ingested += batch.size as u64;
        }
        if let Err(err) = self
            .deps
            .store
            .update_counters(self.config.backfill_id, delta)
            .await
        {
            warn!(%err, "progress counter update failed");
        }

        info!(
            committed = committed.len(),
            rows = delta.rows_processed,
            "batches committed by SMS"
        );
        self.maybe_finished().await
    }

    /// Once fetching is done and everything drained, complete the backfill.
    async fn maybe_finished(&mut self) -> Option<StopReason> {
        if self.done_fetching
            && self.queues.is_empty()
            && self.pk_scan_task.is_none()
            && self.row_fetch_task.is_none()
        {
            return self.finish().await;
        }
        None
    }

    async fn finish(&mut self) -> Option<StopReason> {
        if let Err(err) = self
            .deps
            .store
            .backfill_finished(self.config.backfill_id, self.record.consumer_id)
            .await
        {
            return Some(StopReason::Fatal(err));
        }
        if let Err(err) = self.deps.store.delete_cursor(self.config.backfill_id).await {
            return Some(StopReason::Fatal(err));
        }
        info!(backfill_id = %self.config.backfill_id, "backfill finished");
        Some(StopReason::Finished)
    }

    fn log_status(&self) {
        let snapshot = self.metrics.snapshot_and_reset_window(self.queues.depth());
        info!(
            backfill_id = %self.config.backfill_id,
            batches_fetched = snapshot.batches_fetched,
            messages_fetched = snapshot.messages_fetched,
            messages_flushed = snapshot.messages_flushed,
            messages_filtered_out = snapshot.messages_filtered_out,
            fetch_timeouts = snapshot.fetch_timeouts,
            transient_errors = snapshot.transient_errors,
            sms_retries = snapshot.sms_retries,
            queue_depth = snapshot.queue_depth,
            page_size = self.optimizer.size(),
            sms_pending = self.sms_pending,
            fetch_ms_avg = snapshot.fetch_ms_avg,
            fetch_ms_max = snapshot.fetch_ms_max,
            "table reader status"
        );
    }
}

/// Await a fetch task and translate its outcome (or crash) into a
/// mailbox event.
fn monitor_task<T: Send + 'static>(
    handle: JoinHandle<T>,
    task_tx: mpsc::Sender<TaskEvent>,
    task_ref: Uuid,
    batch_id: BatchId,
    stage: FetchStage,
    into_event: impl FnOnce(T) -> TaskEvent + Send + 'static,
) {
    tokio::spawn(async move {
        let event = match handle.await {
            Ok(out) => into_event(out),
            Err(_) => TaskEvent::TaskCrashed {
                task_ref,
                stage,
                batch_id,
            },
        };
        let _ = task_tx.send(event).await;
    });
}

/// Receive one batches-changed signal; parks forever once the channel
/// closes so the select loop is not spun.
async fn recv_notification(rx: &mut broadcast::Receiver<()>) {
    loop {
        match rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

fn fetch_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let backoff = FETCH_BACKOFF_BASE.saturating_mul(1u32 << exp);
    backoff.min(FETCH_BACKOFF_CAP)
}
