//! Dispatch: how one node's emission becomes jobs for its subscribers.

use super::{GraphLayout, SharedState};
use crate::graph::OutRef;
use crate::queue::failover::FailoverQueue;
use crate::queue::shared::SharedEntry;
use crate::queue::{Job, JobQueue};
use sluice_types::node::ThreadId;
use sluice_types::types::Record;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Handed to every `process` invocation: the thread's local queue, its
/// failover queue, and the routing fabric.
pub struct Forwarder {
    pub(crate) tid: ThreadId,
    pub(crate) local: JobQueue,
    pub(crate) failover: FailoverQueue,
    pub(crate) layout: Arc<GraphLayout>,
    pub(crate) shared: Arc<SharedState>,
    /// After the flush collapse, every chain is serviced locally.
    pub(crate) collapsed: bool,
}

impl Forwarder {
    /// Allocates a fresh record of `out`'s data type, carrying the
    /// outtype's emission label.
    pub fn record(&self, out: OutRef) -> Record {
        let ot = self.layout.outtype(out);
        let mut record = Record::new(ot.dtype.expect("outtype carries a data type"));
        if let Some(label) = ot.label {
            record.add_label(label);
        }
        record
    }

    /// True when `record` is the synthesized flush terminator.
    pub fn is_flush(&self, record: &Record) -> bool {
        record.dtype() == self.layout.flush_dtype
    }

    /// Whether anything subscribes to `out`; lets producers skip work
    /// for unconsumed outtypes.
    pub fn has_subscribers(&self, out: OutRef) -> bool {
        self.layout.outtype(out).has_subscribers()
    }

    /// Emits `record` on `out`: one job for the local subscriber chain,
    /// one push per matching external subscriber. Consumes the caller's
    /// reference; returns whether any subscriber existed.
    pub fn emit(&mut self, out: OutRef, record: Record) -> bool {
        let (local_head, ext_head) = {
            let ot = self.layout.outtype(out);
            (ot.local_head, ot.ext_head)
        };
        let mut any = false;

        if let Some(head) = local_head {
            any = true;
            self.local.push(Job {
                record: record.clone(),
                chain: head,
            });
        }
        if let Some(head) = ext_head {
            any = true;
            if self.collapsed {
                // External chains were folded onto the flush thread;
                // filters are applied at job execution.
                self.local.push(Job {
                    record: record.clone(),
                    chain: head,
                });
            } else {
                let mut cur = Some(head);
                while let Some(sid) = cur {
                    let (matches, target, next) = {
                        let s = &self.layout.subs[sid.index()];
                        (
                            s.filter.map_or(true, |l| record.has_label(l)),
                            s.thread,
                            s.next,
                        )
                    };
                    if matches {
                        self.push_external(record.clone(), sid, target);
                    }
                    cur = next;
                }
            }
        }
        // The producer's own reference drops here, balancing the
        // allocation reference even when nothing subscribed.
        any
    }

    /// Cross-thread push. Acyclic edges block until the bounded push
    /// succeeds. A cycle edge that exhausts its retry budget diverts to
    /// this thread's failover queue; when the full-queue condition
    /// holds for every thread of some cycle at once, the graph
    /// additionally enters recovery mode, pausing sources until the
    /// failover queues drain.
    fn push_external(&mut self, record: Record, sub: crate::graph::SubId, target: ThreadId) {
        let queue = &self.shared.queues[target.index()];
        let in_cycle = self
            .shared
            .cycle
            .as_ref()
            .map_or(false, |c| c.thread_in_cycle[target.index()]);

        if !in_cycle {
            let mut entry = SharedEntry { record, sub };
            loop {
                match queue.push(entry) {
                    Ok(()) => return,
                    Err(back) => entry = back,
                }
            }
        }

        let cycle = self.shared.cycle.as_ref().expect("cycle state allocated");
        match queue.push(SharedEntry { record, sub }) {
            Ok(()) => {
                cycle.full[target.index()].store(false, Ordering::Release);
            }
            Err(entry) => {
                cycle.full[target.index()].store(true, Ordering::Release);
                if cycle.deadlock_exists() {
                    cycle.firehose.store(true, Ordering::Release);
                }
                self.shared
                    .recovery_entries
                    .fetch_add(1, Ordering::Relaxed);
                self.failover.push_back(entry.record, entry.sub);
            }
        }
    }
}
