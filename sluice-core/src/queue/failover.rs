//! Per-thread overflow queue used only when a cycle-participating push
//! cannot complete. Unbounded; entries are restored to the head when a
//! re-push fails so delivery order within the queue is preserved.

use crate::graph::SubId;
use sluice_types::types::Record;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct FailoverQueue {
    q: VecDeque<(Record, SubId)>,
    /// Published length, so other threads can check global emptiness
    /// during deadlock recovery.
    len: Arc<AtomicUsize>,
}

impl FailoverQueue {
    pub fn new(len: Arc<AtomicUsize>) -> Self {
        Self {
            q: VecDeque::new(),
            len,
        }
    }

    pub fn push_back(&mut self, record: Record, sub: SubId) {
        self.q.push_back((record, sub));
        self.len.store(self.q.len(), Ordering::Release);
    }

    pub fn push_front(&mut self, record: Record, sub: SubId) {
        self.q.push_front((record, sub));
        self.len.store(self.q.len(), Ordering::Release);
    }

    pub fn pop_front(&mut self) -> Option<(Record, SubId)> {
        let entry = self.q.pop_front();
        self.len.store(self.q.len(), Ordering::Release);
        entry
    }

    pub fn clear(&mut self) {
        self.q.clear();
        self.len.store(0, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::dtype::TypeId;
    use sluice_types::types::{Field, Record};

    fn rec(v: u64) -> Record {
        Record::with_fields(TypeId(0), vec![Field::UInt(v)])
    }

    #[test]
    fn restore_to_head_preserves_order() {
        let len = Arc::new(AtomicUsize::new(0));
        let mut q = FailoverQueue::new(len.clone());
        q.push_back(rec(1), SubId(0));
        q.push_back(rec(2), SubId(0));
        let (first, sub) = q.pop_front().unwrap();
        assert_eq!(first.fields()[0].as_uint(), Some(1));
        // Re-push failed: restore to head, not tail.
        q.push_front(first, sub);
        assert_eq!(len.load(Ordering::Acquire), 2);
        assert_eq!(q.pop_front().unwrap().0.fields()[0].as_uint(), Some(1));
        assert_eq!(q.pop_front().unwrap().0.fields()[0].as_uint(), Some(2));
        assert_eq!(len.load(Ordering::Acquire), 0);
    }
}
