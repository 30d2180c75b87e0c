//! Outbound delta buffer.
//!
//! Holds local deltas that have not reached the transport yet: edits made
//! before `connect()` resolves, while disconnected, or whose publish failed.
//! Deltas leave in the order they were produced.
//!
//! When the buffer is full it is cleared and flagged for a full-state
//! resync: one snapshot of the whole document supersedes every dropped
//! delta.

use std::collections::VecDeque;

/// Default maximum number of buffered deltas.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// FIFO of unsent deltas with overflow tracking.
#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
    needs_full_state: bool,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            needs_full_state: false,
        }
    }

    /// Buffer a delta. Returns `false` if the buffer overflowed and was
    /// replaced by a pending full-state resync.
    pub fn enqueue(&mut self, delta: Vec<u8>) -> bool {
        if self.needs_full_state {
            // The snapshot taken at flush time already covers this edit.
            return true;
        }
        if self.queue.len() >= self.max_size {
            log::warn!(
                "Outbound queue full ({} deltas), falling back to full-state resync",
                self.queue.len()
            );
            self.queue.clear();
            self.needs_full_state = true;
            return false;
        }
        self.queue.push_back(delta);
        true
    }

    pub fn front(&self) -> Option<&Vec<u8>> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    pub fn needs_full_state(&self) -> bool {
        self.needs_full_state
    }

    /// Request that the next flush send the whole document instead of the
    /// buffered deltas.
    pub fn request_full_state(&mut self) {
        self.queue.clear();
        self.needs_full_state = true;
    }

    /// Called once a full-state update went out: everything buffered is
    /// covered by it.
    pub fn full_state_sent(&mut self) {
        self.queue.clear();
        self.needs_full_state = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing at all is waiting to go out.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && !self.needs_full_state
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.needs_full_state = false;
    }

    /// Total bytes buffered.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
