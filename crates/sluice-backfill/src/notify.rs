//! Batches-changed notifications
//!
//! A small per-consumer broadcast hub. The SMS side calls
//! [`BatchesChangedHub::notify`] after persisting table-reader batches;
//! a subscribed reader runs its persistence sweep immediately instead
//! of waiting for the next periodic tick.

use crate::message::ConsumerId;
use dashmap::DashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 16;

/// Per-consumer broadcast channel for "table reader batches changed".
#[derive(Debug, Default)]
pub struct BatchesChangedHub {
    channels: DashMap<ConsumerId, broadcast::Sender<()>>,
}

impl BatchesChangedHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to change signals for a consumer.
    pub fn subscribe(&self, consumer_id: ConsumerId) -> broadcast::Receiver<()> {
        self.channels
            .entry(consumer_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Signal that the SMS persisted batches for a consumer.
    ///
    /// A no-op when nothing is subscribed.
    pub fn notify(&self, consumer_id: ConsumerId) {
        if let Some(sender) = self.channels.get(&consumer_id) {
            let _ = sender.send(());
        }
    }

    /// Drop a consumer's channel at worker termination.
    pub fn release(&self, consumer_id: ConsumerId) {
        self.channels.remove(&consumer_id);
    }
}
