//! Table reader configuration
//!
//! All tunables with their defaults, plus a builder. `backfill_id` and
//! `table_oid` are required; everything else has a production default.

use crate::error::{BackfillError, Result};
use crate::message::{BackfillId, TableOid};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one table-reader worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReaderConfig {
    /// The backfill this worker drives.
    pub backfill_id: BackfillId,
    /// Source table to page through.
    pub table_oid: TableOid,
    /// SMS backpressure cap: stop fetching while pending messages exceed this.
    pub max_pending_messages: u64,
    /// Starting page size for the PK scan.
    pub initial_page_size: usize,
    /// Per-query timeout budget in milliseconds.
    pub max_timeout_ms: u64,
    /// Upper bound on the adaptive page size.
    pub max_page_size: usize,
    /// Interval of the consumer/slot staleness check in milliseconds.
    pub check_state_timeout_ms: u64,
    /// Interval of the SMS persistence sweep in milliseconds.
    pub check_sms_timeout_ms: u64,
    /// Bound on unflushed + flushed batches held in memory.
    pub max_batches_in_memory: usize,
    /// Cap on a single SMS push retry delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Total elapsed retry budget for one SMS push in milliseconds.
    pub max_backoff_time_ms: u64,
}

impl TableReaderConfig {
    /// Create a config with defaults for the given backfill and table.
    pub fn new(backfill_id: BackfillId, table_oid: TableOid) -> Self {
        Self {
            backfill_id,
            table_oid,
            max_pending_messages: 1_000_000,
            initial_page_size: 1_000,
            max_timeout_ms: 5_000,
            max_page_size: 40_000,
            check_state_timeout_ms: 30_000,
            check_sms_timeout_ms: 5_000,
            max_batches_in_memory: 3,
            max_backoff_ms: 1_000,
            max_backoff_time_ms: 60_000,
        }
    }

    /// Create a builder.
    pub fn builder(backfill_id: BackfillId, table_oid: TableOid) -> TableReaderConfigBuilder {
        TableReaderConfigBuilder {
            config: Self::new(backfill_id, table_oid),
        }
    }

    /// Reject degenerate values.
    pub fn validate(&self) -> Result<()> {
        if self.initial_page_size == 0 {
            return Err(BackfillError::config("initial_page_size must be positive"));
        }
        if self.max_page_size < self.initial_page_size {
            return Err(BackfillError::config(
                "max_page_size must be >= initial_page_size",
            ));
        }
        if self.max_batches_in_memory == 0 {
            return Err(BackfillError::config(
                "max_batches_in_memory must be positive",
            ));
        }
        if self.max_timeout_ms == 0 {
            return Err(BackfillError::config("max_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Per-query timeout budget as a [`Duration`].
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn check_state_interval(&self) -> Duration {
        Duration::from_millis(self.check_state_timeout_ms)
    }

    pub fn check_sms_interval(&self) -> Duration {
        Duration::from_millis(self.check_sms_timeout_ms)
    }
}

/// Builder for [`TableReaderConfig`].
pub struct TableReaderConfigBuilder {
    config: TableReaderConfig,
}

impl TableReaderConfigBuilder {
    pub fn max_pending_messages(mut self, n: u64) -> Self {
        self.config.max_pending_messages = n;
        self
    }

    pub fn initial_page_size(mut self, n: usize) -> Self {
        self.config.initial_page_size = n;
        self
    }

    pub fn max_timeout_ms(mut self, ms: u64) -> Self {
        self.config.max_timeout_ms = ms;
        self
    }

    pub fn max_page_size(mut self, n: usize) -> Self {
        self.config.max_page_size = n;
        self
    }

    pub fn check_state_timeout_ms(mut self, ms: u64) -> Self {
        self.config.check_state_timeout_ms = ms;
        self
    }

    pub fn check_sms_timeout_ms(mut self, ms: u64) -> Self {
        self.config.check_sms_timeout_ms = ms;
        self
    }

    pub fn max_batches_in_memory(mut self, n: usize) -> Self {
        self.config.max_batches_in_memory = n;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn max_backoff_time_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_time_ms = ms;
        self
    }

    pub fn build(self) -> Result<TableReaderConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
