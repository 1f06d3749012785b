//! The per-thread execution loop: source polling, local and external
//! queue draining, deadlock recovery, the source-exhaustion rendezvous,
//! and the single-threaded flush collapse.

mod flush;
mod forwarder;

pub use forwarder::Forwarder;

use crate::errors::ExecutionError;
use crate::graph::{
    CompiledGraph, CycleTopology, OutList, OutRef, OutType, SubId, Subscriber,
};
use crate::module::{Instance, SourceKind, SOURCE_HANDLER};
use crate::queue::failover::FailoverQueue;
use crate::queue::shared::SharedQueue;
use crate::queue::JobQueue;
use crate::runtime::RuntimeOptions;
use crate::{MAX_EXT_JOBS, MAX_LOCAL_JOBS};
use crossbeam::channel::{Receiver, Sender};
use sluice_types::dtype::TypeId;
use sluice_types::log::debug;
use sluice_types::node::{NodeHandle, NodeId, NodeUid, ThreadId};
use sluice_types::parking_lot::Mutex;
use sluice_types::types::{Field, FlushKind, Record};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

/// Process-wide exit counter, monotone within a run. Signal handlers
/// increment it; 1 means leave the loop after the current record.
static EXIT_FLAG: AtomicU32 = AtomicU32::new(0);

pub fn exit_flag() -> u32 {
    EXIT_FLAG.load(Ordering::SeqCst)
}

/// Bumps the exit counter, returning the new value. The driver's
/// signal handler calls this once per delivery and hard-exits at 3.
pub fn request_exit() -> u32 {
    EXIT_FLAG.fetch_add(1, Ordering::SeqCst) + 1
}

pub(crate) fn reset_exit_flag() {
    EXIT_FLAG.store(0, Ordering::SeqCst);
}

/// Builds a synthesized flush record.
pub fn flush_record(flush_dtype: TypeId, kind: FlushKind) -> Record {
    let code = match kind {
        FlushKind::Exit => 0u64,
        FlushKind::Periodic => 1u64,
    };
    Record::with_fields(flush_dtype, vec![Field::UInt(code)])
}

/// Reads the flush kind off a flush record.
pub fn flush_kind(record: &Record) -> FlushKind {
    match record.fields().first().and_then(Field::as_uint) {
        Some(1) => FlushKind::Periodic,
        _ => FlushKind::Exit,
    }
}

/// A source or monitor registration as the scheduler sees it.
pub struct SourceSlot {
    pub node: NodeId,
    pub dtype: TypeId,
    pub slot: u32,
    pub kind: SourceKind,
}

/// Immutable runtime view of the compiled graph, shared by every
/// worker.
pub struct GraphLayout {
    pub node_thread: Vec<ThreadId>,
    pub node_handle: Vec<NodeHandle>,
    pub node_uid: Vec<NodeUid>,
    /// Index of each node within its owning thread's slot vector.
    pub node_local: Vec<u32>,
    pub thread_nodes: Vec<Vec<NodeId>>,
    pub outlists: Vec<OutList>,
    pub subs: Vec<Subscriber>,
    pub flush_out: OutType,
    pub flush_order: Vec<SubId>,
    pub sources: Vec<SourceSlot>,
    pub source_outs: Vec<OutType>,
    pub work_size: u16,
    pub src_threads: Vec<bool>,
    pub writers: Vec<Vec<u16>>,
    pub cycles: Option<CycleTopology>,
    pub thread_cpu: Vec<Option<usize>>,
    pub flush_dtype: TypeId,
    pub no_flush: bool,
    pub loop_count: u32,
}

impl GraphLayout {
    /// Splits a compiled graph into its immutable layout and the owned
    /// node instances.
    pub fn split(g: CompiledGraph, opts: &RuntimeOptions) -> (Self, Vec<Option<Box<dyn Instance>>>) {
        let ws = g.work_size as usize;
        let mut node_local = vec![0u32; g.nodes.len()];
        let mut thread_nodes: Vec<Vec<NodeId>> = vec![Vec::new(); ws];
        for node in &g.nodes {
            node_local[node.id.index()] = thread_nodes[node.thread.index()].len() as u32;
            thread_nodes[node.thread.index()].push(node.id);
        }
        let layout = GraphLayout {
            node_thread: g.nodes.iter().map(|n| n.thread).collect(),
            node_handle: g.nodes.iter().map(|n| n.handle.clone()).collect(),
            node_uid: g.nodes.iter().map(|n| n.uid).collect(),
            node_local,
            thread_nodes,
            outlists: g.outlists,
            subs: g.subs,
            flush_out: g.flush_out,
            flush_order: g.flush_order,
            sources: g
                .sources
                .iter()
                .map(|s| SourceSlot {
                    node: s.node,
                    dtype: s.dtype,
                    slot: s.slot,
                    kind: s.kind,
                })
                .collect(),
            source_outs: g.sources.into_iter().map(|s| s.out).collect(),
            work_size: g.work_size,
            src_threads: g.src_threads,
            writers: g.writers,
            cycles: g.cycles,
            thread_cpu: g.thread_cpu,
            flush_dtype: g.flush_dtype,
            no_flush: opts.no_exit_flush,
            loop_count: opts.loop_count.max(1),
        };
        (layout, g.instances)
    }

    pub fn outtype(&self, out: OutRef) -> &OutType {
        match out {
            OutRef::Node { node, index } => &self.outlists[node.index()].outtypes[index as usize],
            OutRef::Source(i) => &self.source_outs[i as usize],
            OutRef::Flush => &self.flush_out,
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_thread.len()
    }
}

/// Counters for the end-of-run rendezvous. Guarded by one mutex, as
/// the protocols that read them tolerate staleness but not torn
/// updates.
pub struct Rendezvous {
    pub ready_to_flush: u32,
    pub spinning_on_jobs: u32,
    pub num_src_threads: u32,
}

/// Per-run cycle bookkeeping: the detected SCCs, a full-queue flag per
/// thread, the recovery-mode latch, and each thread's failover-queue
/// length mirror.
pub struct CycleState {
    pub firehose: AtomicBool,
    pub full: Vec<AtomicBool>,
    pub sccs: Vec<Vec<u16>>,
    pub thread_in_cycle: Vec<bool>,
    pub failover_len: Vec<Arc<AtomicUsize>>,
}

impl CycleState {
    /// The deadlock predicate: some cycle has every member thread
    /// simultaneously blocked on a full queue.
    pub fn deadlock_exists(&self) -> bool {
        self.sccs.iter().any(|scc| {
            scc.iter()
                .all(|t| self.full[*t as usize].load(Ordering::Acquire))
        })
    }

    pub fn failover_queues_empty(&self) -> bool {
        self.failover_len
            .iter()
            .all(|l| l.load(Ordering::Acquire) == 0)
    }
}

/// State shared by all workers of one run.
pub struct SharedState {
    pub work_size: u16,
    pub queues: Vec<SharedQueue>,
    pub rendezvous: Mutex<Rendezvous>,
    pub ready_to_exit: AtomicU32,
    pub hop_next: AtomicU32,
    pub barrier: Barrier,
    pub cycle: Option<CycleState>,
    pub flushes_aborted: AtomicBool,
    pub recovery_entries: AtomicU64,
    /// Run-local exit latch raised when all source threads exhaust.
    pub exit: AtomicU32,
    /// Whether any spinning thread serviced work during the current
    /// synchronous-drain round.
    pub round_activity: AtomicBool,
}

impl SharedState {
    pub fn new(layout: &GraphLayout, opts: &RuntimeOptions) -> Self {
        let ws = layout.work_size as usize;
        let qlen = opts.shared_queue_len.max(2);
        let queues = (0..ws)
            .map(|t| {
                if layout.writers[t].len() <= 1 {
                    SharedQueue::spsc(qlen)
                } else {
                    SharedQueue::mpsc(qlen)
                }
            })
            .collect();
        let cycle = layout.cycles.as_ref().map(|topo| CycleState {
            firehose: AtomicBool::new(false),
            full: (0..ws).map(|_| AtomicBool::new(false)).collect(),
            sccs: topo.sccs.clone(),
            thread_in_cycle: topo.thread_in_cycle.clone(),
            failover_len: (0..ws).map(|_| Arc::new(AtomicUsize::new(0))).collect(),
        });
        let num_src_threads = layout.src_threads.iter().filter(|s| **s).count() as u32;
        SharedState {
            work_size: layout.work_size,
            queues,
            rendezvous: Mutex::new(Rendezvous {
                ready_to_flush: 0,
                spinning_on_jobs: layout.work_size as u32,
                num_src_threads,
            }),
            ready_to_exit: AtomicU32::new(0),
            hop_next: AtomicU32::new(0),
            barrier: Barrier::new(ws),
            cycle,
            flushes_aborted: AtomicBool::new(false),
            recovery_entries: AtomicU64::new(0),
            exit: AtomicU32::new(0),
            round_activity: AtomicBool::new(false),
        }
    }

    pub fn effective_exit(&self) -> u32 {
        exit_flag().max(self.exit.load(Ordering::SeqCst))
    }

    fn raise_exit_floor(&self) {
        let _ = self
            .exit
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// One bound node instance living on its assigned worker.
pub(crate) struct KidSlot {
    pub node: NodeId,
    pub instance: Box<dyn Instance>,
}

pub(crate) struct FlushBundle {
    pub nodes: Vec<KidSlot>,
}

pub(crate) enum Handoff {
    /// Worker 0: receives every other worker's nodes for the collapse.
    Primary(Receiver<FlushBundle>),
    /// Other workers: surrender their nodes before the final barrier.
    Secondary(Sender<FlushBundle>),
}

pub(crate) struct Worker {
    pub tid: ThreadId,
    pub nodes: Vec<KidSlot>,
    pub sources: Vec<u32>,
    pub monitors: Vec<u32>,
    pub fwd: Forwarder,
    pub shared: Arc<SharedState>,
    pub layout: Arc<GraphLayout>,
    empty_src_cnt: u32,
    loops_remaining: u32,
}

impl Worker {
    pub(crate) fn new(
        tid: ThreadId,
        nodes: Vec<KidSlot>,
        layout: Arc<GraphLayout>,
        shared: Arc<SharedState>,
    ) -> Self {
        let sources = layout
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.kind == SourceKind::Source && layout.node_thread[s.node.index()] == tid
            })
            .map(|(i, _)| i as u32)
            .collect();
        let monitors = layout
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.kind == SourceKind::Monitor && layout.node_thread[s.node.index()] == tid
            })
            .map(|(i, _)| i as u32)
            .collect();
        let failover_len = shared
            .cycle
            .as_ref()
            .map(|c| c.failover_len[tid.index()].clone())
            .unwrap_or_default();
        let fwd = Forwarder {
            tid,
            local: JobQueue::new(),
            failover: FailoverQueue::new(failover_len),
            layout: layout.clone(),
            shared: shared.clone(),
            collapsed: false,
        };
        let loops_remaining = layout.loop_count;
        Worker {
            tid,
            nodes,
            sources,
            monitors,
            fwd,
            shared,
            layout,
            empty_src_cnt: 0,
            loops_remaining,
        }
    }

    fn firehose(&self) -> bool {
        self.shared
            .cycle
            .as_ref()
            .map_or(false, |c| c.firehose.load(Ordering::Acquire))
    }

    /// One scheduler pass. Returns `false` once this thread's sources
    /// are exhausted for good.
    fn pass(&mut self) -> bool {
        let has_sources = !self.sources.is_empty();
        let mut src_out = 0usize;

        if self.firehose() {
            // Recovery mode: external work first, then chip away at the
            // failover queue; sources stay off until all queues clear.
            let ext = self.do_external_jobs(MAX_EXT_JOBS);
            if ext != 0 {
                return true;
            }
            self.recover_failover();
            src_out = 1;
        } else {
            for k in 0..self.sources.len() {
                if self.firehose() {
                    // A dispatch within this very pass tripped the
                    // deadlock predicate; keep the graph alive but stop
                    // feeding it.
                    src_out = src_out.max(1);
                    break;
                }
                let si = self.sources[k] as usize;
                let (dtype, slot, node) = {
                    let s = &self.layout.sources[si];
                    (s.dtype, s.slot, s.node)
                };
                let local = self.layout.node_local[node.index()] as usize;
                let scratch = Record::new(dtype);
                let produced =
                    self.nodes[local]
                        .instance
                        .process(SOURCE_HANDLER, &scratch, &mut self.fwd, slot);
                if produced > 0 {
                    src_out += 1;
                }
            }
            for k in 0..self.monitors.len() {
                let si = self.monitors[k] as usize;
                let (dtype, slot, node) = {
                    let s = &self.layout.sources[si];
                    (s.dtype, s.slot, s.node)
                };
                let local = self.layout.node_local[node.index()] as usize;
                let scratch = Record::new(dtype);
                self.nodes[local]
                    .instance
                    .process(SOURCE_HANDLER, &scratch, &mut self.fwd, slot);
            }
        }

        if has_sources && src_out == 0 {
            if self.loops_remaining > 1 {
                self.loops_remaining -= 1;
                return true;
            }
            debug!("worker {}: no more input on any source", self.tid);
            return false;
        }

        let mut jobs = self.do_local_jobs(MAX_LOCAL_JOBS);
        jobs += self.do_external_jobs(MAX_EXT_JOBS);
        if jobs == 0 {
            self.idle_backoff();
        } else {
            self.empty_src_cnt = 0;
        }
        true
    }

    fn do_local_jobs(&mut self, limit: usize) -> usize {
        let mut count = 0;
        while count < limit {
            let Some(job) = self.fwd.local.pop() else {
                break;
            };
            count += 1;
            self.run_job(job);
        }
        count
    }

    fn run_job(&mut self, job: crate::queue::Job) {
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
                let local = self.layout.node_local[node.index()] as usize;
                self.nodes[local]
                    .instance
                    .process(handler, &job.record, &mut self.fwd, slot);
            }
            cur = next;
        }
        // The queue's reference to the record drops here.
    }

    fn do_external_jobs(&mut self, limit: usize) -> usize {
        if self.layout.work_size <= 1 {
            return 0;
        }
        let mut count = 0;
        while count < limit {
            let Some(entry) = self.shared.queues[self.tid.index()].try_pop() else {
                break;
            };
            count += 1;
            let (node, handler, slot) = {
                let s = &self.layout.subs[entry.sub.index()];
                (s.node, s.handler, s.slot)
            };
            let local = self.layout.node_local[node.index()] as usize;
            self.nodes[local]
                .instance
                .process(handler, &entry.record, &mut self.fwd, slot);
            // External dispatch checked the source-label filter on the
            // producer side; the record reference drops here.
        }
        count
    }

    /// Re-pushes one failover entry toward its destination, then lifts
    /// recovery mode once every failover queue in the graph is empty.
    fn recover_failover(&mut self) {
        let Some((record, sub)) = self.fwd.failover.pop_front() else {
            return;
        };
        let target = self.layout.subs[sub.index()].thread;
        if let Err(back) = self.shared.queues[target.index()]
            .push(crate::queue::shared::SharedEntry { record, sub })
        {
            // Restore to the head to preserve delivery order.
            self.fwd.failover.push_front(back.record, back.sub);
        }
        if let Some(cycle) = &self.shared.cycle {
            let _guard = self.shared.rendezvous.lock();
            if cycle.failover_queues_empty() {
                debug!("failover queues drained; leaving recovery mode");
                cycle.firehose.store(false, Ordering::Release);
            }
        }
    }

    /// One failover re-push attempt without the all-clear check, used
    /// on the drain paths.
    fn try_flush_failover_once(&mut self) {
        if self.shared.cycle.is_none() {
            return;
        }
        if let Some((record, sub)) = self.fwd.failover.pop_front() {
            let target = self.layout.subs[sub.index()].thread;
            if let Err(back) = self.shared.queues[target.index()]
                .push(crate::queue::shared::SharedEntry { record, sub })
            {
                self.fwd.failover.push_front(back.record, back.sub);
            }
        }
    }

    fn idle_backoff(&mut self) {
        if self.empty_src_cnt < 100 {
            self.empty_src_cnt += 1;
            std::thread::yield_now();
        } else if self.empty_src_cnt < 1000 {
            self.empty_src_cnt += 1;
            std::thread::sleep(Duration::from_micros(10));
        } else if self.empty_src_cnt < 10000 {
            self.empty_src_cnt += 1;
            std::thread::sleep(Duration::from_micros(100));
        } else {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// External-queue-only pass used while waiting out other threads.
    fn execute_only_external(&mut self) -> usize {
        self.try_flush_failover_once();
        let jobs = self.do_external_jobs(MAX_EXT_JOBS);
        if jobs == 0 {
            std::thread::yield_now();
        }
        jobs
    }

    /// Local + external drain used while queues empty out at exit.
    fn run_exiting(&mut self) -> usize {
        self.try_flush_failover_once();
        let mut jobs = self.do_local_jobs(usize::MAX);
        jobs += self.do_external_jobs(MAX_EXT_JOBS);
        if jobs == 0 {
            std::thread::yield_now();
        }
        jobs
    }

    /// Round-robin drain: each thread in turn runs its local and
    /// external queues to empty while the others keep servicing their
    /// external queues, until a full round finds no work anywhere.
    fn empty_all_queues_synchronously(&mut self) {
        let ws = self.shared.work_size as u32;
        if ws <= 1 {
            while self.run_exiting() > 0 {}
            return;
        }
        while self.shared.ready_to_exit.load(Ordering::SeqCst) < ws {
            for ithread in 0..ws {
                let mut toggle = false;
                self.shared.barrier.wait();
                if self.tid.0 == 0 {
                    self.shared.hop_next.store(0, Ordering::SeqCst);
                    self.shared.rendezvous.lock().spinning_on_jobs = ws - 1;
                }
                self.shared.barrier.wait();

                if ithread == self.tid.0 as u32 {
                    if self.run_exiting() > 0 {
                        self.shared.ready_to_exit.store(0, Ordering::SeqCst);
                    } else {
                        self.shared.ready_to_exit.fetch_add(1, Ordering::SeqCst);
                    }
                    self.shared.hop_next.store(1, Ordering::SeqCst);
                } else {
                    loop {
                        if self.shared.hop_next.load(Ordering::SeqCst) != 0
                            && self.shared.rendezvous.lock().spinning_on_jobs == 0
                        {
                            break;
                        }
                        let jobs = self.execute_only_external();
                        if jobs > 0 {
                            self.shared.round_activity.store(true, Ordering::SeqCst);
                        }
                        if jobs == 0 && !toggle {
                            self.shared.rendezvous.lock().spinning_on_jobs -= 1;
                            toggle = true;
                        } else if jobs > 0 && toggle {
                            self.shared.rendezvous.lock().spinning_on_jobs += 1;
                            toggle = false;
                        }
                    }
                }
            }
            self.shared.barrier.wait();
            // A failover re-push or a spinning thread's dispatch can
            // leave work behind after every owner reported idle this
            // round; confirm real quiescence before declaring the
            // drain complete.
            if self.tid.0 == 0 {
                let residue = self.shared.round_activity.swap(false, Ordering::SeqCst)
                    || self.shared.queues.iter().any(|q| !q.is_empty())
                    || self
                        .shared
                        .cycle
                        .as_ref()
                        .map_or(false, |c| !c.failover_queues_empty());
                if residue {
                    self.shared.ready_to_exit.store(0, Ordering::SeqCst);
                }
            }
            self.shared.barrier.wait();
        }
    }

    pub(crate) fn run(mut self, handoff: Handoff) -> Result<(), ExecutionError> {
        if let Some(cpu) = self.layout.thread_cpu[self.tid.index()] {
            core_affinity::set_for_current(core_affinity::CoreId { id: cpu });
        }
        self.shared.barrier.wait();

        while self.shared.effective_exit() == 0 {
            if !self.pass() {
                let mut guard = self.shared.rendezvous.lock();
                guard.num_src_threads = guard.num_src_threads.saturating_sub(1);
                if guard.num_src_threads == 0 {
                    self.shared.raise_exit_floor();
                }
                break;
            }
        }

        {
            self.shared.rendezvous.lock().ready_to_flush += 1;
        }
        let ws = self.shared.work_size as u32;
        if ws > 1 {
            // Signals do not reach every thread at once; keep servicing
            // external work until everyone has cut off their sources.
            loop {
                if self.shared.rendezvous.lock().ready_to_flush == ws {
                    break;
                }
                self.execute_only_external();
            }
        }

        // No thread may hang because another is still blocked writing
        // into a full shared queue.
        let mut toggle = false;
        loop {
            if self.shared.rendezvous.lock().spinning_on_jobs == 0 {
                break;
            }
            let jobs = self.execute_only_external();
            if jobs == 0 && !toggle {
                self.shared.rendezvous.lock().spinning_on_jobs -= 1;
                toggle = true;
            } else if jobs > 0 && toggle {
                self.shared.rendezvous.lock().spinning_on_jobs += 1;
                toggle = false;
            }
        }

        self.empty_all_queues_synchronously();

        match handoff {
            Handoff::Secondary(tx) => {
                let nodes = std::mem::take(&mut self.nodes);
                let _ = tx.send(FlushBundle { nodes });
                self.shared.barrier.wait();
                if self.shared.flushes_aborted.load(Ordering::SeqCst) {
                    return Err(ExecutionError::FlushAborted);
                }
            }
            Handoff::Primary(rx) => {
                let mut all: Vec<Option<KidSlot>> =
                    (0..self.layout.node_count()).map(|_| None).collect();
                for slot in std::mem::take(&mut self.nodes) {
                    let idx = slot.node.index();
                    all[idx] = Some(slot);
                }
                for _ in 1..self.shared.work_size {
                    let bundle = rx.recv().map_err(|_| ExecutionError::WorkerPanic)?;
                    for slot in bundle.nodes {
                        let idx = slot.node.index();
                        all[idx] = Some(slot);
                    }
                }
                if !self.flush_graph(&mut all) {
                    self.shared.flushes_aborted.store(true, Ordering::SeqCst);
                }
                self.shared.barrier.wait();
                if self.shared.flushes_aborted.load(Ordering::SeqCst) {
                    return Err(ExecutionError::FlushAborted);
                }
                self.destroy_graph(&mut all);
            }
        }
        Ok(())
    }
}
