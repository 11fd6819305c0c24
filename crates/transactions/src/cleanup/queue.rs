//! The cleanup priority queue

use super::entry::AtrCleanupEntry;
use parking_lot::Mutex;
use std::collections::BinaryHeap;

/// Min-heap of cleanup work, ordered by not-before time (oldest first).
/// Producers push from any thread; the worker is the only popper.
#[derive(Default)]
pub struct CleanupQueue {
    heap: Mutex<BinaryHeap<AtrCleanupEntry>>,
}

impl CleanupQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entry.
    pub fn push(&self, entry: AtrCleanupEntry) {
        self.heap.lock().push(entry);
    }

    /// Pop the oldest entry if its not-before time (plus the safety
    /// window) has passed.
    pub fn pop_ready(&self) -> Option<AtrCleanupEntry> {
        let mut heap = self.heap.lock();
        if heap.peek().map(|e| e.ready()).unwrap_or(false) {
            heap.pop()
        } else {
            None
        }
    }

    /// Pop the oldest entry regardless of time. For shutdown drains and
    /// tests.
    pub fn pop_any(&self) -> Option<AtrCleanupEntry> {
        self.heap.lock().pop()
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::DocumentId;
    use std::time::{Duration, Instant};

    fn entry(attempt: &str, age: Duration) -> AtrCleanupEntry {
        let mut e = AtrCleanupEntry::for_client_attempt(
            DocumentId::new("b", "_default", "_default", "_txn:atr-0-#0"),
            attempt.into(),
        );
        e.min_start_time = Instant::now() - age;
        e
    }

    #[test]
    fn pop_ready_respects_safety_window() {
        let queue = CleanupQueue::new();
        queue.push(entry("young", Duration::ZERO));
        assert!(queue.pop_ready().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_ready_returns_oldest_first() {
        let queue = CleanupQueue::new();
        queue.push(entry("younger", Duration::from_secs(2)));
        queue.push(entry("oldest", Duration::from_secs(60)));
        queue.push(entry("middle", Duration::from_secs(10)));
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_ready())
            .map(|e| e.attempt_id)
            .collect();
        assert_eq!(order, ["oldest", "middle", "younger"]);
    }

    #[test]
    fn pop_any_ignores_time() {
        let queue = CleanupQueue::new();
        queue.push(entry("young", Duration::ZERO));
        assert!(queue.pop_any().is_some());
        assert!(queue.is_empty());
    }
}
