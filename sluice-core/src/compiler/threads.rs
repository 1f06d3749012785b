//! Thread-id remapping, thread-level cycle detection, and CPU
//! selection.

use super::ParseGraph;
use crate::errors::CompileError;
use crate::graph::{CompiledGraph, CycleTopology};
use crate::runtime::RuntimeOptions;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use sluice_types::ahash::AHashMap;
use sluice_types::log::info;
use sluice_types::node::ThreadId;

/// Compacts user-visible thread ids to a dense `[0, N)` space, in order
/// of first appearance.
pub(crate) fn remap(pg: &mut ParseGraph) -> Result<(), CompileError> {
    if pg.procs.is_empty() {
        return Err(CompileError::EmptyGraph);
    }
    let mut dense: AHashMap<u32, u16> = AHashMap::new();
    let mut order = Vec::new();
    for proc in &mut pg.procs {
        let next = dense.len() as u16;
        let id = *dense.entry(proc.user_tid).or_insert_with(|| {
            order.push(proc.user_tid);
            next
        });
        proc.thread = ThreadId(id);
    }
    pg.user_tids = order;
    pg.work_size = dense.len() as u16;
    if pg.work_size > 1 {
        info!("graph requires {} worker threads", pg.work_size);
    }
    Ok(())
}

/// Builds the thread-level digraph from the shared-queue writer matrix
/// and runs Tarjan's algorithm over it. Components of size >= 2 mark
/// their threads as cycle participants; those threads get failover
/// queues at startup.
pub(crate) fn detect_cycles(g: &mut CompiledGraph) {
    let ws = g.work_size as usize;
    if ws <= 1 {
        return;
    }
    let mut dg = DiGraph::<u16, ()>::new();
    let idx: Vec<_> = (0..ws as u16).map(|t| dg.add_node(t)).collect();
    for (consumer, writers) in g.writers.iter().enumerate() {
        for writer in writers {
            if *writer as usize != consumer {
                dg.add_edge(idx[*writer as usize], idx[consumer], ());
            }
        }
    }
    let sccs: Vec<Vec<u16>> = tarjan_scc(&dg)
        .into_iter()
        .filter(|c| c.len() >= 2)
        .map(|c| c.into_iter().map(|n| dg[n]).collect())
        .collect();

    if sccs.is_empty() {
        info!("no communication cycles among threads");
        return;
    }
    info!(
        "strongly connected thread components: {:?} ({} potential deadlock cycle{})",
        sccs,
        sccs.len(),
        if sccs.len() == 1 { "" } else { "s" }
    );
    let mut thread_in_cycle = vec![false; ws];
    for scc in &sccs {
        for t in scc {
            thread_in_cycle[*t as usize] = true;
        }
    }
    g.cycles = Some(CycleTopology {
        thread_in_cycle,
        sccs,
    });
}

/// Pins each dense thread to a physical core: the core list rotated by
/// the configured offset. Skipped entirely when pinning is disabled or
/// the platform reports no cores.
pub(crate) fn select_cpus(g: &mut CompiledGraph, opts: &RuntimeOptions) {
    if !opts.pin_cpus {
        return;
    }
    let Some(cores) = core_affinity::get_core_ids() else {
        return;
    };
    if cores.is_empty() {
        return;
    }
    let offset = opts.cpu_offset.unwrap_or(0);
    for t in 0..g.work_size as usize {
        g.thread_cpu[t] = Some(cores[(t + offset) % cores.len()].id);
    }
}
