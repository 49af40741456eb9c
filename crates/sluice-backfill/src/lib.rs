//! # sluice-backfill - Backfill table reader
//!
//! Streams the existing contents of a relational table into a change
//! pipeline as if every row were an event, while the pipeline keeps
//! streaming live changes. One worker runs per active backfill.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  scan pks   ┌──────────────────────────────┐
//! │  Source DB  │◄────────────┤        TableReader           │
//! │  (adapter)  │  fetch rows │  mailbox-owned state machine │
//! └──────┬──────┘◄────────────┤                              │
//!        │ watermarks         │  cursor · queues · optimizer │
//!        ▼                    └──────┬───────────────▲───────┘
//! ┌─────────────┐   flush_batch     │ push          │ unpersisted ids
//! │ CDC pipeline├───────────────────┘               │
//! └──────┬──────┘                  ┌────────────────┴───────┐
//!        │ pks_seen                │   Slot Message Store   │
//!        ▼                         └────────────────────────┘
//! ┌─────────────┐
//! │  PK index   │  shared, lock-free; never routes through the mailbox
//! └─────────────┘
//! ```
//!
//! Every fetched page is bracketed by a low and a high watermark
//! written through the replication slot. The CDC pipeline correlates
//! the bracket with its own stream position and calls back with
//! `flush_batch`; rows whose primary keys the pipeline has meanwhile
//! reported via `pks_seen` are dropped before the batch is pushed, so
//! a row is never delivered both as a snapshot message and as an
//! earlier-ordered change event.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use sluice_backfill::{PkIndexRegistry, ReaderDeps, TableReader, TableReaderConfig};
//!
//! let config = TableReaderConfig::builder(backfill_id, table_oid)
//!     .initial_page_size(1_000)
//!     .build()?;
//!
//! let handle = TableReader::spawn(config, deps).await?;
//!
//! // CDC event path, hot and mailbox-free:
//! PkIndexRegistry::global().pks_seen(handle.consumer_id(), &changed_pks);
//!
//! // CDC pipeline, on reaching a batch's high watermark:
//! handle.flush_batch(batch_id, commit_lsn).await;
//!
//! let reason = handle.await_stopped().await;
//! ```

mod batch;
mod config;
mod cursor;
mod error;
mod fetch;
mod message;
mod metrics;
mod notify;
mod page_size;
mod pk_index;
mod reader;
mod sms;
mod source;
mod store;

pub use batch::{Batch, BatchQueues};
pub use config::{TableReaderConfig, TableReaderConfigBuilder};
pub use cursor::{Cursor, KeyValue, PkTuple};
pub use error::{BackfillError, ErrorCategory, Result, StopReason};
pub use fetch::BracketedFetch;
pub use message::{BackfillId, BatchId, ConsumerId, Lsn, RowMessage, TableOid};
pub use metrics::{MetricsSnapshot, ReaderMetrics};
pub use notify::BatchesChangedHub;
pub use page_size::{PageSizeOptimizer, PageSizeSample};
pub use pk_index::{BatchPkIndex, PkIndexRegistry};
pub use reader::{ReaderDeps, TableReader, TableReaderHandle};
pub use sms::{push_with_retry, SlotMessageStore, SmsRetryPolicy};
pub use source::{PkScanPage, SourceDb, WatermarkEmitter};
pub use store::{BackfillRecord, BackfillStore, ProgressDelta};
