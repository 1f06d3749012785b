//! Bounded cross-thread queue with two variants resolved after graph
//! compile: a lock-free MPSC queue for the general case, and a cheaper
//! single-producer ring chosen when only one thread writes to a
//! consumer.
//!
//! Per-producer push order is preserved by both variants; ordering
//! across producers is not guaranteed.

use crate::graph::SubId;
use crate::SHARED_QUEUE_RETRY_LIMIT;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::{Backoff, CachePadded};
use sluice_types::types::Record;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One external delivery: a record bound for a specific subscriber.
#[derive(Clone, Debug)]
pub struct SharedEntry {
    pub record: Record,
    pub sub: SubId,
}

/// Single-producer single-reader ring. The writer owns `tail`, the
/// reader owns `head`; each observes the other side with an acquire
/// load before touching a slot.
///
/// Safety invariant: exactly one thread pushes and exactly one thread
/// pops. The compiler's queue demotion step guarantees this by only
/// selecting the ring when the distinct-writer set has cardinality <= 1.
pub struct SpscRing {
    slots: Box<[UnsafeCell<Option<SharedEntry>>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    len: AtomicUsize,
}

unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

impl SpscRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring needs at least one usable slot");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            len: AtomicUsize::new(0),
        }
    }

    pub fn try_push(&self, entry: SharedEntry) -> Result<(), SharedEntry> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.slots.len();
        if next == self.head.load(Ordering::Acquire) {
            return Err(entry);
        }
        unsafe {
            *self.slots[tail].get() = Some(entry);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    pub fn try_pop(&self) -> Option<SharedEntry> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let entry = unsafe { (*self.slots[head].get()).take() };
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.head.store((head + 1) % self.slots.len(), Ordering::Release);
        entry
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

/// Bounded cross-thread queue, MPSC by default, demoted to SPSC after
/// compile when only one thread writes to it.
pub enum SharedQueue {
    Mpsc(ArrayQueue<SharedEntry>),
    Spsc(SpscRing),
}

impl SharedQueue {
    pub fn mpsc(capacity: usize) -> Self {
        SharedQueue::Mpsc(ArrayQueue::new(capacity))
    }

    pub fn spsc(capacity: usize) -> Self {
        // One ring slot is sacrificed to distinguish full from empty.
        SharedQueue::Spsc(SpscRing::new(capacity + 1))
    }

    pub fn is_spsc(&self) -> bool {
        matches!(self, SharedQueue::Spsc(_))
    }

    pub fn try_push(&self, entry: SharedEntry) -> Result<(), SharedEntry> {
        match self {
            SharedQueue::Mpsc(q) => q.push(entry),
            SharedQueue::Spsc(q) => q.try_push(entry),
        }
    }

    /// Bounded-retry push: up to [`SHARED_QUEUE_RETRY_LIMIT`] attempts,
    /// yielding between. Returns the entry on exhaustion so the caller
    /// can fail over or keep spinning.
    pub fn push(&self, entry: SharedEntry) -> Result<(), SharedEntry> {
        let backoff = Backoff::new();
        let mut entry = entry;
        for _ in 0..=SHARED_QUEUE_RETRY_LIMIT {
            match self.try_push(entry) {
                Ok(()) => return Ok(()),
                Err(back) => entry = back,
            }
            backoff.snooze();
        }
        Err(entry)
    }

    pub fn try_pop(&self) -> Option<SharedEntry> {
        match self {
            SharedQueue::Mpsc(q) => q.pop(),
            SharedQueue::Spsc(q) => q.try_pop(),
        }
    }

    /// Blocking pop, spinning with backoff until an entry arrives.
    pub fn pop(&self) -> SharedEntry {
        let backoff = Backoff::new();
        loop {
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            backoff.snooze();
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SharedQueue::Mpsc(q) => q.len(),
            SharedQueue::Spsc(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::dtype::TypeId;
    use sluice_types::types::{Field, Record};
    use std::sync::Arc;

    fn entry(v: u64) -> SharedEntry {
        SharedEntry {
            record: Record::with_fields(TypeId(0), vec![Field::UInt(v)]),
            sub: SubId(0),
        }
    }

    fn value(e: &SharedEntry) -> u64 {
        e.record.fields()[0].as_uint().unwrap()
    }

    #[test]
    fn spsc_preserves_fifo_and_bounds() {
        let q = SharedQueue::spsc(4);
        for i in 0..4 {
            q.try_push(entry(i)).unwrap();
        }
        assert!(q.try_push(entry(99)).is_err());
        for i in 0..4 {
            assert_eq!(value(&q.try_pop().unwrap()), i);
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn mpsc_bounded_push_gives_entry_back() {
        let q = SharedQueue::mpsc(2);
        q.push(entry(1)).unwrap();
        q.push(entry(2)).unwrap();
        let back = q.push(entry(3)).unwrap_err();
        assert_eq!(value(&back), 3);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn spsc_cross_thread_order() {
        let q = Arc::new(SharedQueue::spsc(8));
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    let mut e = entry(i);
                    loop {
                        match q.try_push(e) {
                            Ok(()) => break,
                            Err(back) => {
                                e = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            })
        };
        let mut seen = Vec::with_capacity(1000);
        while seen.len() < 1000 {
            if let Some(e) = q.try_pop() {
                seen.push(value(&e));
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }
}
