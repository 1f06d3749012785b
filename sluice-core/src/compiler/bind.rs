//! Module binding and two-phase instance initialization.

use super::ParseGraph;
use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{CompiledGraph, EdgeSpec, NodeSpec, OutList, OutType, SourceSpec};
use crate::module::{InitCtx, ModuleRegistry, SourceKind, SourceRegistrar};
use crate::runtime::RuntimeOptions;
use sluice_types::ahash::AHashMap;
use sluice_types::log::{debug, warn};
use sluice_types::node::{NodeHandle, NodeId, NodeUid};

/// Resolves every parse node to a module, assigns versions and uids,
/// and runs phase-1 init. Sources and monitors self-register through
/// the registrar during this pass.
pub(crate) fn bind(
    pg: ParseGraph,
    modules: &ModuleRegistry,
    env: &mut Env,
    opts: &RuntimeOptions,
) -> Result<CompiledGraph, CompileError> {
    let ws = pg.work_size as usize;
    let node_count = pg.procs.len();

    let mut use_counts: AHashMap<String, u32> = AHashMap::new();
    let mut nodes = Vec::with_capacity(node_count);
    let mut outlists = Vec::with_capacity(node_count);
    let mut instances: Vec<Option<Box<dyn crate::module::Instance>>> =
        Vec::with_capacity(node_count);
    let mut sources: Vec<SourceSpec> = Vec::new();

    // Edges are resolved up front so filters and ports are interned
    // once.
    let mut edges_per_node: Vec<Vec<EdgeSpec>> = vec![Vec::new(); node_count];
    for edge in &pg.edges {
        let crossing = pg.procs[edge.src].thread != pg.procs[edge.dst].thread;
        edges_per_node[edge.src].push(EdgeSpec {
            dst: NodeId(edge.dst as u32),
            port: edge.port.as_deref().map(|p| env.labels.register(p)),
            filter: edge.filter.as_deref().map(|f| env.labels.register(f)),
            crossing,
        });
    }

    for (i, proc) in pg.procs.iter().enumerate() {
        let module = modules
            .resolve(&proc.name)
            .ok_or_else(|| CompileError::UnknownModule(proc.name.clone()))?;
        if module.deprecated() {
            warn!("module `{}` is deprecated", module.name());
        }
        if proc.deprecated_pipe && opts.verbose {
            warn!("node `{}` was split off with deprecated `||`", proc.name);
        }
        let version = {
            let count = use_counts.entry(module.name().to_string()).or_insert(0);
            let v = *count;
            *count += 1;
            v
        };
        let id = NodeId(i as u32);
        let uid = NodeUid(i as u32 + 1);
        let handle = NodeHandle::new(module.name(), version);
        debug!(
            "binding {handle}, uid {}, thread {}",
            uid.0, proc.thread
        );

        let mut node = NodeSpec {
            id,
            handle: handle.clone(),
            uid,
            args: proc.args.clone(),
            thread: proc.thread,
            edges: std::mem::take(&mut edges_per_node[i]),
            flush_registered: false,
            input_valid: false,
            is_source: false,
            next_slot: 0,
            inputs: Vec::new(),
        };

        let mut registrar = SourceRegistrar::new(id, sources.len() as u32);
        let instance = {
            let mut ctx = InitCtx {
                args: &node.args,
                handle: &handle,
                uid,
                thread: node.thread,
                env,
                sources: &mut registrar,
            };
            module.init(&mut ctx)?
        };
        for (dtype, kind) in registrar.regs.drain(..) {
            let slot = node.next_slot;
            node.next_slot += 1;
            if kind == SourceKind::Source {
                node.is_source = true;
            }
            sources.push(SourceSpec {
                node: id,
                dtype,
                slot,
                kind,
                out: OutType::new(dtype, None),
            });
        }

        nodes.push(node);
        outlists.push(OutList::new(id));
        instances.push(Some(instance));
    }

    let flush_dtype = env.flush_type();
    let monitor_dtype = env.monitor_type();
    Ok(CompiledGraph {
        nodes,
        outlists,
        subs: Vec::new(),
        flush_out: OutType::new(flush_dtype, None),
        flush_order: Vec::new(),
        sources,
        work_size: pg.work_size,
        user_tids: pg.user_tids,
        src_threads: vec![false; ws],
        writers: vec![Vec::new(); ws],
        cycles: None,
        thread_cpu: vec![None; ws],
        instances,
        flush_dtype,
        monitor_dtype,
    })
}

/// Phase-2 init, after sharing has been verified, so modules can
/// rendezvous through the state-table registry.
pub(crate) fn init_finish(g: &mut CompiledGraph, env: &mut Env) -> Result<(), CompileError> {
    for instance in g.instances.iter_mut() {
        if let Some(inst) = instance.as_mut() {
            inst.init_finish(env)?;
        }
    }
    Ok(())
}
