//! Batches and the in-memory batch queues

use crate::cursor::Cursor;
use crate::message::{BatchId, Lsn, RowMessage};
use std::collections::VecDeque;

/// One fetched page of rows, immutable once produced.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    /// The keyset cursor at which this batch begins (not where it ends).
    pub cursor: Cursor,
    /// Slot write position observed at fetch time; staleness detection
    /// compares it against the live slot position.
    pub approximate_lsn: Lsn,
    /// Row payloads. Cleared once pushed to the SMS to reclaim memory.
    pub messages: Vec<RowMessage>,
    /// Message count, retained after `messages` is cleared.
    pub size: usize,
}

impl Batch {
    pub fn new(id: BatchId, cursor: Cursor, approximate_lsn: Lsn, messages: Vec<RowMessage>) -> Self {
        let size = messages.len();
        Self {
            id,
            cursor,
            approximate_lsn,
            messages,
            size,
        }
    }

    /// Drop the payloads after a successful SMS push.
    pub fn clear_messages(&mut self) {
        self.messages = Vec::new();
    }
}

/// The two ordered batch buffers.
///
/// `unflushed` holds batches waiting for their `flush_batch` call from
/// the CDC pipeline; `flushed` holds batches pushed to the SMS and
/// awaiting persistence acknowledgement. Their combined depth is
/// bounded, and `unflushed` cursors are strictly increasing.
#[derive(Debug)]
pub struct BatchQueues {
    unflushed: VecDeque<Batch>,
    flushed: VecDeque<Batch>,
    max_in_memory: usize,
}

impl BatchQueues {
    pub fn new(max_in_memory: usize) -> Self {
        Self {
            unflushed: VecDeque::new(),
            flushed: VecDeque::new(),
            max_in_memory,
        }
    }

    /// Combined depth of both queues.
    pub fn depth(&self) -> usize {
        self.unflushed.len() + self.flushed.len()
    }

    /// Whether another batch may be fetched.
    pub fn has_capacity(&self) -> bool {
        self.depth() < self.max_in_memory
    }

    pub fn is_empty(&self) -> bool {
        self.unflushed.is_empty() && self.flushed.is_empty()
    }

    /// Append a freshly fetched batch.
    pub fn push_unflushed(&mut self, batch: Batch) {
        debug_assert!(self.depth() < self.max_in_memory, "batch queue overflow");
        // Strictly increasing except the degenerate case where the
        // configured minimum coincides with the first row's key: the
        // first batch starts at the minimum inclusively and the second
        // at the same value exclusively.
        debug_assert!(
            self.unflushed
                .back()
                .map(|prev| prev.cursor <= batch.cursor)
                .unwrap_or(true),
            "unflushed cursors must be nondecreasing"
        );
        self.unflushed.push_back(batch);
    }

    /// Head of the unflushed queue; flushes apply here only.
    pub fn head_unflushed(&self) -> Option<&Batch> {
        self.unflushed.front()
    }

    /// Pop the head for flushing.
    pub fn pop_unflushed_head(&mut self) -> Option<Batch> {
        self.unflushed.pop_front()
    }

    pub fn unflushed_is_empty(&self) -> bool {
        self.unflushed.is_empty()
    }

    /// Unflushed batches, head first, for the staleness probe.
    pub fn unflushed(&self) -> impl Iterator<Item = &Batch> {
        self.unflushed.iter()
    }

    /// Move a pushed batch to the flushed queue.
    pub fn push_flushed(&mut self, batch: Batch) {
        self.flushed.push_back(batch);
    }

    /// Check for a batch in the flushed queue.
    pub fn contains_flushed(&self, id: BatchId) -> bool {
        self.flushed.iter().any(|b| b.id == id)
    }

    /// Ids of all flushed batches, queue order.
    pub fn flushed_ids(&self) -> Vec<BatchId> {
        self.flushed.iter().map(|b| b.id).collect()
    }

    /// Remove flushed batches the SMS no longer reports unpersisted,
    /// in queue order. Returns the committed batches for cursor
    /// persistence and counter updates.
    pub fn take_committed(&mut self, unpersisted: &[BatchId]) -> Vec<Batch> {
        let mut committed = Vec::new();
        let mut keep = VecDeque::with_capacity(self.flushed.len());
        for batch in self.flushed.drain(..) {
            if unpersisted.contains(&batch.id) {
                keep.push_back(batch);
            } else {
                committed.push(batch);
            }
        }
        self.flushed = keep;
        committed
    }
}
