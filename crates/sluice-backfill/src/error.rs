//! Error types for the backfill table reader
//!
//! Errors carry enough classification for the state machine to decide
//! between local recovery (backoff, page-size tuning) and terminating
//! the worker with a reason a supervisor can act on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the table reader and its ports.
#[derive(Error, Debug)]
pub enum BackfillError {
    /// A source query exhausted its per-query timeout budget.
    ///
    /// Feeds the page-size optimizer; does not count as a fetch failure.
    #[error("query timed out after {elapsed_ms}ms at page size {page_size}")]
    QueryTimeout { page_size: usize, elapsed_ms: u64 },

    /// Transient source-database error; recovered with backoff.
    #[error("transient database error: {0}")]
    TransientDb(String),

    /// SMS rejected the batch payload as too large.
    #[error("SMS payload too large for batch {batch_id}")]
    SmsPayloadTooLarge { batch_id: crate::message::BatchId },

    /// SMS returned an error the reader cannot recover from.
    #[error("SMS fatal error: {0}")]
    SmsFatal(String),

    /// SMS is unreachable or its process has died.
    #[error("SMS unavailable: {0}")]
    SmsDown(String),

    /// The replication slot does not exist.
    #[error("replication slot {0:?} not found")]
    SlotNotFound(String),

    /// The slot advanced past an unflushed batch's fetch position.
    #[error("stale batch: batch lsn {batch_lsn} behind slot lsn {slot_lsn}")]
    StaleBatch {
        batch_lsn: crate::message::Lsn,
        slot_lsn: crate::message::Lsn,
    },

    /// The backfill was deactivated while the worker was running.
    #[error("backfill {0} deactivated")]
    BackfillDeactivated(crate::message::BackfillId),

    /// The owning consumer record no longer exists.
    #[error("consumer {0} missing")]
    ConsumerMissing(crate::message::ConsumerId),

    /// Internal protocol violation (e.g. duplicate flush of a pushed batch).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackfillError {
    /// Create a transient database error.
    pub fn transient_db(msg: impl Into<String>) -> Self {
        Self::TransientDb(msg.into())
    }

    /// Create an SMS fatal error.
    pub fn sms_fatal(msg: impl Into<String>) -> Self {
        Self::SmsFatal(msg.into())
    }

    /// Create an SMS unavailable error.
    pub fn sms_down(msg: impl Into<String>) -> Self {
        Self::SmsDown(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if the reader recovers from this error locally.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::QueryTimeout { .. } | Self::TransientDb(_) | Self::SmsPayloadTooLarge { .. }
        )
    }

    /// Check if this error increments the successive-failure counter.
    ///
    /// Query timeouts are routed into the page-size optimizer instead.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::QueryTimeout { .. })
    }

    /// Category label for logs and metrics.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::QueryTimeout { .. } => ErrorCategory::QueryTimeout,
            Self::TransientDb(_) => ErrorCategory::Database,
            Self::SmsPayloadTooLarge { .. } | Self::SmsFatal(_) | Self::SmsDown(_) => {
                ErrorCategory::Sms
            }
            Self::SlotNotFound(_) | Self::StaleBatch { .. } => ErrorCategory::Replication,
            Self::BackfillDeactivated(_) | Self::ConsumerMissing(_) => ErrorCategory::Lifecycle,
            Self::InvalidState(_) => ErrorCategory::Protocol,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) | Self::Io(_) => ErrorCategory::Other,
        }
    }
}

/// Error categories for metrics and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    QueryTimeout,
    Database,
    Sms,
    Replication,
    Lifecycle,
    Protocol,
    Configuration,
    Other,
}

impl ErrorCategory {
    /// Stable label for log fields and metric dimensions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryTimeout => "query_timeout",
            Self::Database => "database",
            Self::Sms => "sms",
            Self::Replication => "replication",
            Self::Lifecycle => "lifecycle",
            Self::Protocol => "protocol",
            Self::Configuration => "configuration",
            Self::Other => "other",
        }
    }
}

/// Why the worker exited.
///
/// Normal completions and structural failures are distinguished so a
/// supervisor can decide whether to restart from the persisted cursor.
#[derive(Debug)]
pub enum StopReason {
    /// All rows flushed and committed; the persisted cursor was deleted.
    Finished,
    /// The backfill was deactivated; the cursor stays persisted.
    Deactivated,
    /// The owning consumer disappeared.
    ConsumerMissing,
    /// The SMS died or became unreachable.
    SmsDown,
    /// An unflushed batch's fetch position fell behind the slot.
    ///
    /// A restart re-fetches from the persisted cursor with fresh watermarks.
    StaleBatch {
        batch_lsn: crate::message::Lsn,
        slot_lsn: crate::message::Lsn,
    },
    /// Unrecoverable error.
    Fatal(BackfillError),
}

impl StopReason {
    /// Check whether this is a normal (non-error) exit.
    pub fn is_normal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Deactivated | Self::ConsumerMissing | Self::SmsDown
        )
    }
}

/// Result type for backfill operations.
pub type Result<T> = std::result::Result<T, BackfillError>;
