//! Event queue with lazy deletion
//!
//! A `BinaryHeap` of `(time, seq)` keys plus a `HashMap` holding the live
//! entries. The map is the source of truth; heap keys whose entry was
//! removed are discarded on peek/pop. The sequence number is assigned at
//! insert time, so entries sharing a time come out in insertion order.

use crate::error::ClockError;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Handle to a queued entry, usable for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u64);

impl EventHandle {
    /// The insertion sequence number.
    pub fn seq(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug)]
struct Key {
    time: f64,
    seq: u64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.time.to_bits() == other.time.to_bits() && self.seq == other.seq
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so the ordering is reversed.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.seq.cmp(&other.seq))
            .reverse()
    }
}

/// Min-queue of entries keyed by `(time, insertion sequence)`.
pub struct EventQueue<M> {
    heap: BinaryHeap<Key>,
    live: HashMap<u64, (f64, M)>,
    next_seq: u64,
}

impl<M> Default for EventQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventQueue<M> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Insert an entry due at `time`.
    pub fn insert(&mut self, time: f64, meta: M) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq, (time, meta));
        self.heap.push(Key { time, seq });
        EventHandle(seq)
    }

    /// Remove an entry. Returns it if it was still queued.
    pub fn remove(&mut self, handle: EventHandle) -> Option<(f64, M)> {
        self.live.remove(&handle.0)
    }

    pub fn contains(&self, handle: EventHandle) -> bool {
        self.live.contains_key(&handle.0)
    }

    /// Earliest due time, without removal.
    pub fn peek_min(&mut self) -> Option<f64> {
        self.clean_top();
        self.heap.peek().map(|k| k.time)
    }

    /// Remove and return the earliest entry.
    pub fn pop_min(&mut self) -> Result<(f64, M), ClockError> {
        while let Some(k) = self.heap.pop() {
            // stale key: entry was removed
            if let Some(entry) = self.live.remove(&k.seq) {
                return Ok(entry);
            }
        }
        Err(ClockError::EmptyQueue)
    }

    /// Pop the earliest entry only if it is due exactly at `time`.
    pub fn pop_due(&mut self, time: f64) -> Option<(EventHandle, M)> {
        self.clean_top();
        let k = self.heap.peek()?;
        if k.time.to_bits() != time.to_bits() {
            return None;
        }
        let seq = k.seq;
        self.heap.pop();
        self.live.remove(&seq).map(|(_, m)| (EventHandle(seq), m))
    }

    fn clean_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            if self.live.contains_key(&k.seq) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Drop every entry and restart the sequence counter.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.next_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut q: EventQueue<&str> = EventQueue::new();

        q.insert(0.5, "first");
        q.insert(0.2, "second");
        q.insert(0.8, "third");

        assert_eq!(q.peek_min(), Some(0.2));
        let (t, meta) = q.pop_min().unwrap();
        assert!((t - 0.2).abs() < 1e-10);
        assert_eq!(meta, "second");

        let (t, meta) = q.pop_min().unwrap();
        assert!((t - 0.5).abs() < 1e-10);
        assert_eq!(meta, "first");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_empty_queue() {
        let mut q: EventQueue<u32> = EventQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.peek_min(), None);
        assert_eq!(q.pop_min(), Err(ClockError::EmptyQueue));
    }

    #[test]
    fn test_remove() {
        let mut q: EventQueue<i32> = EventQueue::new();

        q.insert(0.5, 100);
        let h = q.insert(0.2, 200);
        q.insert(0.8, 300);

        assert_eq!(q.remove(h), Some((0.2, 200)));
        assert_eq!(q.remove(h), None);
        assert!(!q.contains(h));

        // stale heap key is skipped
        assert_eq!(q.peek_min(), Some(0.5));
        assert_eq!(q.pop_min().unwrap().1, 100);
    }

    #[test]
    fn test_fifo_on_equal_times() {
        let mut q: EventQueue<u32> = EventQueue::new();

        q.insert(5.0, 1);
        q.insert(3.0, 0);
        q.insert(5.0, 2);
        q.insert(5.0, 3);

        let order: Vec<u32> = std::iter::from_fn(|| q.pop_min().ok().map(|(_, m)| m)).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_pop_due_only_matches_exact_time() {
        let mut q: EventQueue<char> = EventQueue::new();
        q.insert(1.0, 'a');
        q.insert(1.0, 'b');
        q.insert(2.0, 'c');

        assert_eq!(q.pop_due(2.0), None);
        assert_eq!(q.pop_due(1.0).map(|(_, m)| m), Some('a'));
        assert_eq!(q.pop_due(1.0).map(|(_, m)| m), Some('b'));
        assert_eq!(q.pop_due(1.0), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_clear_restarts_sequence() {
        let mut q: EventQueue<()> = EventQueue::new();
        q.insert(1.0, ());
        q.insert(2.0, ());
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.insert(0.0, ()).seq(), 0);
    }
}
