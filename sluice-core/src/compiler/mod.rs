//! The graph compiler: AST in, bound and schedulable graph out.
//!
//! Stages run in a fixed order: function expansion and bundle rewriting,
//! variable collapse, thread-id remapping, module binding with two-phase
//! init (sharing verified in between), subscriber and flush wiring,
//! thread-level cycle detection, queue demotion input, and CPU selection.

pub mod bind;
pub mod collapse;
pub mod expand;
pub mod graphviz;
pub mod threads;
pub mod wiring;

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::CompiledGraph;
use crate::module::ModuleRegistry;
use crate::runtime::RuntimeOptions;
use sluice_types::ast::Stmt;
use sluice_types::node::ThreadId;

/// A processing node as it exists between parsing and binding.
#[derive(Clone, Debug)]
pub struct ParseProc {
    pub name: String,
    pub args: Vec<String>,
    /// Thread id as written in the config.
    pub user_tid: u32,
    /// Dense thread id after remapping.
    pub thread: ThreadId,
    /// Node was created by the deprecated `||` operator.
    pub deprecated_pipe: bool,
}

/// A node-to-node edge after variable collapse.
#[derive(Clone, Debug)]
pub struct ParseEdge {
    pub src: usize,
    pub dst: usize,
    pub filter: Option<String>,
    pub port: Option<String>,
}

/// The collapsed parse graph: processing nodes and direct edges only.
/// Variables exist only at parse time and never reach this form.
#[derive(Debug, Default)]
pub struct ParseGraph {
    pub procs: Vec<ParseProc>,
    pub edges: Vec<ParseEdge>,
    /// Dense thread id -> user thread id, in first-appearance order.
    pub user_tids: Vec<u32>,
    pub work_size: u16,
}

/// Runs the front half of the compiler: expansion, collapse, and
/// thread-id remapping. The result is what `-G` renders.
pub fn parse_stage(ast: &[Stmt], opts: &RuntimeOptions) -> Result<ParseGraph, CompileError> {
    let raw = expand::expand(ast, opts)?;
    let mut pg = collapse::collapse(raw)?;
    threads::remap(&mut pg)?;
    Ok(pg)
}

/// Runs the back half of the compiler on an already-parsed graph.
pub fn compile_parsed(
    pg: ParseGraph,
    modules: &ModuleRegistry,
    env: &mut Env,
    opts: &RuntimeOptions,
) -> Result<CompiledGraph, CompileError> {
    let mut graph = bind::bind(pg, modules, env, opts)?;
    env.tables.verify_sharing();
    bind::init_finish(&mut graph, env)?;
    wiring::wire(&mut graph, env, opts)?;
    threads::detect_cycles(&mut graph);
    threads::select_cpus(&mut graph, opts);
    Ok(graph)
}

/// Compiles an AST all the way to a schedulable graph.
pub fn compile(
    ast: &[Stmt],
    modules: &ModuleRegistry,
    env: &mut Env,
    opts: &RuntimeOptions,
) -> Result<CompiledGraph, CompileError> {
    let pg = parse_stage(ast, opts)?;
    compile_parsed(pg, modules, env, opts)
}
