//! Reader observability
//!
//! Atomic counters for lock-free updates from the owner loop plus a
//! windowed fetch-timing aggregate that resets on every periodic log
//! tick.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Metrics collector for one table-reader worker.
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    batches_fetched: AtomicU64,
    messages_fetched: AtomicU64,
    messages_flushed: AtomicU64,
    /// Rows dropped at flush because CDC superseded them.
    messages_filtered_out: AtomicU64,
    fetch_timeouts: AtomicU64,
    transient_errors: AtomicU64,
    sms_retries: AtomicU64,
    timing: Mutex<TimingWindow>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TimingWindow {
    count: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

impl ReaderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, messages: u64) {
        self.batches_fetched.fetch_add(1, Ordering::Relaxed);
        self.messages_fetched.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn record_flush(&self, pushed: u64, filtered_out: u64) {
        self.messages_flushed.fetch_add(pushed, Ordering::Relaxed);
        self.messages_filtered_out
            .fetch_add(filtered_out, Ordering::Relaxed);
    }

    pub fn record_fetch_timeout(&self) {
        self.fetch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record payload-too-large retries reported by one SMS push.
    pub fn record_sms_retries(&self, retries: u64) {
        self.sms_retries.fetch_add(retries, Ordering::Relaxed);
    }

    /// Record one fetch round trip (slower stage) in the window.
    pub fn record_fetch_ms(&self, elapsed_ms: u64) {
        let mut window = self.timing.lock().unwrap();
        if window.count == 0 {
            window.min_ms = elapsed_ms;
            window.max_ms = elapsed_ms;
        } else {
            window.min_ms = window.min_ms.min(elapsed_ms);
            window.max_ms = window.max_ms.max(elapsed_ms);
        }
        window.count += 1;
        window.total_ms += elapsed_ms;
    }

    /// Snapshot counters and drain the timing window.
    pub fn snapshot_and_reset_window(&self, queue_depth: usize) -> MetricsSnapshot {
        let window = {
            let mut guard = self.timing.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        MetricsSnapshot {
            batches_fetched: self.batches_fetched.load(Ordering::Relaxed),
            messages_fetched: self.messages_fetched.load(Ordering::Relaxed),
            messages_flushed: self.messages_flushed.load(Ordering::Relaxed),
            messages_filtered_out: self.messages_filtered_out.load(Ordering::Relaxed),
            fetch_timeouts: self.fetch_timeouts.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            sms_retries: self.sms_retries.load(Ordering::Relaxed),
            queue_depth,
            fetches_in_window: window.count,
            fetch_ms_min: window.min_ms,
            fetch_ms_max: window.max_ms,
            fetch_ms_avg: if window.count > 0 {
                window.total_ms / window.count
            } else {
                0
            },
        }
    }
}

/// Point-in-time view of the reader's counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_fetched: u64,
    pub messages_fetched: u64,
    pub messages_flushed: u64,
    pub messages_filtered_out: u64,
    pub fetch_timeouts: u64,
    pub transient_errors: u64,
    pub sms_retries: u64,
    pub queue_depth: usize,
    pub fetches_in_window: u64,
    pub fetch_ms_min: u64,
    pub fetch_ms_max: u64,
    pub fetch_ms_avg: u64,
}
