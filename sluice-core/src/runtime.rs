//! Process context and run orchestration: compile a graph, spawn one
//! worker per thread, join them, and report.

use crate::compiler;
use crate::env::{Env, DEFAULT_STATESTORE_MAX};
use crate::errors::{CompileError, ExecutionError};
use crate::graph::CompiledGraph;
use crate::module::ModuleRegistry;
use crate::scheduler::{
    reset_exit_flag, FlushBundle, GraphLayout, Handoff, KidSlot, SharedState, Worker,
};
use crate::DEFAULT_SHARED_QUEUE_LEN;
use crossbeam::channel;
use sluice_types::ast::Stmt;
use sluice_types::log::debug;
use sluice_types::node::ThreadId;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::Builder;

#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Fail compile when a non-source node ends up with no accepted
    /// input.
    pub input_validate: bool,
    pub verbose: bool,
    /// Skip the exit flush entirely.
    pub no_exit_flush: bool,
    pub seed: u32,
    /// How many times the source set is re-armed before exhaustion
    /// counts.
    pub loop_count: u32,
    pub shared_queue_len: usize,
    pub cpu_offset: Option<usize>,
    pub pin_cpus: bool,
    /// State-table report verbosity at teardown; 0 is silent.
    pub table_stats: u8,
    pub statestore_max: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let statestore_max = std::env::var("SLUICE_STATESTORE_MAX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_STATESTORE_MAX);
        Self {
            input_validate: false,
            verbose: false,
            no_exit_flush: false,
            seed: 0,
            loop_count: 1,
            shared_queue_len: DEFAULT_SHARED_QUEUE_LEN,
            cpu_offset: None,
            pin_cpus: false,
            table_stats: 0,
            statestore_max,
        }
    }
}

/// What a completed run reports back.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub work_size: u16,
    /// How many times dispatch diverted to a failover queue.
    pub recovery_entries: u64,
    pub detected_cycles: usize,
    /// Which inbound queues ran as the single-producer variant.
    pub spsc_queues: Vec<bool>,
}

pub struct Runtime {
    pub env: Env,
    pub modules: ModuleRegistry,
    pub opts: RuntimeOptions,
}

impl Runtime {
    pub fn new(modules: ModuleRegistry, opts: RuntimeOptions) -> Self {
        let env = Env::new(opts.seed, opts.statestore_max);
        Self { env, modules, opts }
    }

    pub fn compile(&mut self, ast: &[Stmt]) -> Result<CompiledGraph, CompileError> {
        compiler::compile(ast, &self.modules, &mut self.env, &self.opts)
    }

    /// Executes a compiled graph to completion: spawns workers 1..N,
    /// runs worker 0 on the calling thread, joins, flush included.
    pub fn run(&mut self, graph: CompiledGraph) -> Result<RunReport, ExecutionError> {
        let detected_cycles = graph.cycles.as_ref().map_or(0, |c| c.sccs.len());
        let (layout, mut instances) = GraphLayout::split(graph, &self.opts);
        let layout = Arc::new(layout);
        reset_exit_flag();
        let shared = Arc::new(SharedState::new(&layout, &self.opts));

        let (tx, rx) = channel::unbounded::<FlushBundle>();
        let mut workers = Vec::with_capacity(layout.work_size as usize);
        for t in 0..layout.work_size {
            let tid = ThreadId(t);
            let nodes = layout.thread_nodes[tid.index()]
                .iter()
                .map(|id| KidSlot {
                    node: *id,
                    instance: instances[id.index()].take().expect("instance present"),
                })
                .collect();
            workers.push(Worker::new(tid, nodes, layout.clone(), shared.clone()));
        }

        let worker0 = workers.remove(0);
        let mut handles = Vec::new();
        for worker in workers {
            let sender = tx.clone();
            let name = format!("sluice-worker-{}", worker.tid);
            handles.push(
                Builder::new()
                    .name(name)
                    .spawn(move || worker.run(Handoff::Secondary(sender)))?,
            );
        }
        drop(tx);

        debug!("starting graph on {} worker(s)", layout.work_size);
        let primary_result = worker0.run(Handoff::Primary(rx));

        let mut failure = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure = Some(e),
                Err(_) => failure = Some(ExecutionError::WorkerPanic),
            }
        }
        primary_result?;
        if let Some(e) = failure {
            return Err(e);
        }

        self.env.tables.summary(self.opts.table_stats);
        Ok(RunReport {
            work_size: layout.work_size,
            recovery_entries: shared.recovery_entries.load(Ordering::Relaxed),
            detected_cycles,
            spsc_queues: shared.queues.iter().map(|q| q.is_spsc()).collect(),
        })
    }

    /// Compile-and-run convenience.
    pub fn execute(&mut self, ast: &[Stmt]) -> Result<RunReport, ExecutionError> {
        let graph = self.compile(ast)?;
        self.run(graph)
    }
}
