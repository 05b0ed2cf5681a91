//! Offline queue for local fragments produced while the channel is down.
//!
//! Queued fragments are replayed, oldest first, once the session is synced
//! again. When the queue fills up it is compacted into a single full-state
//! fragment, which supersedes everything queued so far.

use std::collections::VecDeque;

use crate::replica::UpdateFragment;

pub struct OfflineQueue {
    queue: VecDeque<UpdateFragment>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.clamp(1, 1024)),
            max_size: max_size.max(1),
        }
    }

    /// Queue a fragment. Returns `false` when the queue is full; the caller
    /// is expected to [`compact`](Self::compact) it.
    pub fn enqueue(&mut self, fragment: UpdateFragment) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(fragment);
        true
    }

    /// Put back a fragment whose send failed, ahead of everything else.
    pub fn requeue_front(&mut self, fragment: UpdateFragment) {
        self.queue.push_front(fragment);
    }

    /// Replace the whole queue with one fragment covering all of it.
    pub fn compact(&mut self, full_state: UpdateFragment) {
        log::warn!(
            "Offline queue full ({} fragments); compacting into full state",
            self.queue.len()
        );
        self.queue.clear();
        self.queue.push_back(full_state);
    }

    pub fn drain(&mut self) -> Vec<UpdateFragment> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(UpdateFragment::len).sum()
    }
}
