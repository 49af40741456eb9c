//! Slot message store port and push retry
//!
//! The SMS is the downstream buffering layer. It accepts whole batches,
//! reports which batch ids it has not yet persisted, and exposes a
//! pending-message count used for backpressure.

use crate::error::{BackfillError, Result};
use crate::message::{BatchId, ConsumerId, RowMessage};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::warn;

/// Initial delay of the payload-too-large retry envelope.
const RETRY_BASE: Duration = Duration::from_millis(50);

/// Slot message store adapter.
#[async_trait]
pub trait SlotMessageStore: Send + Sync + 'static {
    /// Accept a flushed batch.
    ///
    /// Errors: [`BackfillError::SmsPayloadTooLarge`] when the batch
    /// exceeds the store's payload limit (retried by the caller);
    /// anything else is surfaced immediately.
    async fn put_batch(
        &self,
        consumer: ConsumerId,
        batch_id: BatchId,
        messages: Vec<RowMessage>,
    ) -> Result<()>;

    /// Of the given batch ids, the ones not yet durably persisted.
    async fn unpersisted_batch_ids(
        &self,
        consumer: ConsumerId,
        batch_ids: &[BatchId],
    ) -> Result<Vec<BatchId>>;

    /// Messages currently pending for the consumer, all sources.
    async fn count_messages(&self, consumer: ConsumerId) -> Result<u64>;
}

/// Retry envelope for one SMS push.
#[derive(Debug, Clone, Copy)]
pub struct SmsRetryPolicy {
    /// Cap on a single retry delay.
    pub max_backoff: Duration,
    /// Total elapsed budget across retries.
    pub max_backoff_time: Duration,
}

impl Default for SmsRetryPolicy {
    fn default() -> Self {
        Self {
            max_backoff: Duration::from_millis(1_000),
            max_backoff_time: Duration::from_millis(60_000),
        }
    }
}

/// Push a batch, retrying payload-too-large with exponential backoff.
///
/// Backoff doubles from 50ms up to `max_backoff`; once total elapsed
/// time exceeds `max_backoff_time` the error is surfaced. Any other
/// error is surfaced immediately and is fatal for the batch. On
/// success, returns how many rejected attempts were retried so the
/// caller can feed its retry counter.
pub async fn push_with_retry(
    sms: &dyn SlotMessageStore,
    consumer: ConsumerId,
    batch_id: BatchId,
    messages: Vec<RowMessage>,
    policy: SmsRetryPolicy,
) -> Result<u32> {
    let started = Instant::now();
    let mut delay = RETRY_BASE;
    let mut retries = 0u32;

    loop {
        match sms.put_batch(consumer, batch_id, messages.clone()).await {
            Ok(()) => return Ok(retries),
            Err(err @ BackfillError::SmsPayloadTooLarge { .. }) => {
                if started.elapsed() >= policy.max_backoff_time {
                    warn!(%batch_id, retries, "SMS payload-too-large retries exhausted");
                    return Err(err);
                }
                retries += 1;
                warn!(%batch_id, delay_ms = delay.as_millis() as u64, "SMS payload too large, backing off");
                sleep(delay).await;
                delay = (delay * 2).min(policy.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}
