//! The ordered flush protocol. After the synchronous drain, worker 0
//! owns every node instance; outputs are rewired onto its local queue
//! and the recorded flush order is walked with a synthesized flush
//! record. The collapse is permanent: steady-state processing is never
//! re-entered afterwards.

use super::{flush_record, KidSlot, Worker};
use sluice_types::log::{debug, error};
use sluice_types::types::FlushKind;

const MAX_FLUSHES: u32 = 0x7FFF_FFFF;
const MAX_FLUSH_ITERS: u32 = 1 << 20;

impl Worker {
    /// Runs the flush walk. Returns `false` when the protocol had to be
    /// abandoned.
    pub(crate) fn flush_graph(&mut self, all: &mut [Option<KidSlot>]) -> bool {
        if self.layout.no_flush {
            return true;
        }
        if self.tid.0 != 0 {
            error!("flush must run on thread 0");
            return false;
        }
        debug!("attempting to flush");
        self.fwd.collapsed = true;
        let record = flush_record(self.layout.flush_dtype, FlushKind::Exit);

        let order = self.layout.flush_order.clone();
        let mut total_iters = 0u32;
        let mut i = 0usize;
        while i < order.len() {
            let (node, handler, slot) = {
                let s = &self.layout.subs[order[i].index()];
                (s.node, s.handler, s.slot)
            };
            let mut flushes = 0u32;
            let mut jobs;
            loop {
                jobs = 0;
                flushes += 1;
                total_iters += 1;
                if let Some(kid) = all[node.index()].as_mut() {
                    kid.instance.process(handler, &record, &mut self.fwd, slot);
                }
                jobs += self.run_jobs_collapsed(all);
                if !(jobs >= 1 && flushes < MAX_FLUSHES && total_iters < MAX_FLUSH_ITERS) {
                    break;
                }
            }
            // A flusher that produced work may have fed earlier
            // flushers; restart the walk from just past the front.
            if flushes > 1 && flushes < MAX_FLUSHES && total_iters < MAX_FLUSH_ITERS {
                i = 0;
            }
            i += 1;
        }
        true
    }

    /// Drains the collapsed local queue, walking each job's full
    /// subscriber chain against the instance table worker 0 now owns.
    pub(crate) fn run_jobs_collapsed(&mut self, all: &mut [Option<KidSlot>]) -> usize {
        let mut count = 0;
        while let Some(job) = self.fwd.local.pop() {
            count += 1;
            let mut cur = Some(job.chain);
            while let Some(sid) = cur {
                let (matches, node, handler, slot, next) = {
                    let s = &self.layout.subs[sid.index()];
                    (
                        s.filter.map_or(true, |l| job.record.has_label(l)),
                        s.node,
                        s.handler,
                        s.slot,
                        s.next,
                    )
                };
                if matches {
                    if let Some(kid) = all[node.index()].as_mut() {
                        kid.instance.process(handler, &job.record, &mut self.fwd, slot);
                    }
                }
                cur = next;
            }
        }
        count
    }

    /// Module teardown, serialized on worker 0, grouped by the thread
    /// each node ran on.
    pub(crate) fn destroy_graph(&mut self, all: &mut [Option<KidSlot>]) {
        for t in 0..self.layout.work_size as usize {
            if self.layout.work_size > 1 {
                debug!("node summary for thread {t}:");
            }
            for id in &self.layout.thread_nodes[t] {
                if let Some(kid) = all[id.index()].as_mut() {
                    let stats = kid.instance.destroy();
                    debug!(
                        "  {}: processed {} emitted {}",
                        self.layout.node_handle[id.index()],
                        stats.processed,
                        stats.emitted
                    );
                }
            }
        }
    }
}
