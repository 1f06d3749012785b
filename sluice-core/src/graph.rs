//! Data model of the compiled, schedulable graph: nodes, outtypes,
//! subscriber arena, flush order, and the thread-level cycle topology.

use crate::module::{Instance, ProcHandler, SourceKind};
use sluice_types::dtype::TypeId;
use sluice_types::label::LabelId;
use sluice_types::node::{NodeHandle, NodeId, NodeUid, ThreadId};

/// Index into the graph's subscriber arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubId(pub u32);

impl SubId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resolved consumer-side binding for one outtype: which node, on which
/// thread, through which process handler and input slot, gated by which
/// port and source-label filter. Subscribers form chains through `next`.
#[derive(Clone, Debug)]
pub struct Subscriber {
    pub node: NodeId,
    pub thread: ThreadId,
    pub handler: ProcHandler,
    pub slot: u32,
    pub port: Option<LabelId>,
    pub filter: Option<LabelId>,
    pub next: Option<SubId>,
}

/// A `(data type, optional emission label)` slot a node has declared it
/// can emit, with its local and external subscriber chains.
#[derive(Clone, Debug, Default)]
pub struct OutType {
    pub dtype: Option<TypeId>,
    pub label: Option<LabelId>,
    pub local_head: Option<SubId>,
    pub ext_head: Option<SubId>,
}

impl OutType {
    pub fn new(dtype: TypeId, label: Option<LabelId>) -> Self {
        Self {
            dtype: Some(dtype),
            label,
            local_head: None,
            ext_head: None,
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.local_head.is_some() || self.ext_head.is_some()
    }
}

/// Handle a module stores for one of its declared outtypes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutRef {
    /// Outtype `index` in `node`'s outlist.
    Node { node: NodeId, index: u32 },
    /// The outtype owned by source (or monitor) registration `index`.
    Source(u32),
    /// The runtime's flush outtype.
    Flush,
}

/// The outtypes a node may emit, declared through `input_set`.
#[derive(Clone, Debug)]
pub struct OutList {
    node: NodeId,
    pub outtypes: Vec<OutType>,
}

impl OutList {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            outtypes: Vec::new(),
        }
    }

    pub fn find(&self, dtype: TypeId, label: Option<LabelId>) -> Option<OutRef> {
        self.outtypes
            .iter()
            .position(|ot| ot.dtype == Some(dtype) && ot.label == label)
            .map(|index| OutRef::Node {
                node: self.node,
                index: index as u32,
            })
    }

    /// Find-or-add semantics: declaring the same `(type, label)` twice
    /// yields the same outtype.
    pub fn add_outtype(&mut self, dtype: TypeId, label: Option<LabelId>) -> OutRef {
        if let Some(found) = self.find(dtype, label) {
            return found;
        }
        let index = self.outtypes.len() as u32;
        self.outtypes.push(OutType::new(dtype, label));
        OutRef::Node {
            node: self.node,
            index,
        }
    }
}

/// A directed edge between two bound nodes.
#[derive(Clone, Debug)]
pub struct EdgeSpec {
    pub dst: NodeId,
    pub port: Option<LabelId>,
    pub filter: Option<LabelId>,
    pub crossing: bool,
}

/// A `(type, port)` pair a node has accepted, with the handler and slot
/// its module assigned.
#[derive(Clone, Debug)]
pub struct InputBinding {
    pub dtype: TypeId,
    pub port: Option<LabelId>,
    pub handler: ProcHandler,
    pub slot: u32,
}

/// One bound node of the runtime graph.
#[derive(Debug)]
pub struct NodeSpec {
    pub id: NodeId,
    pub handle: NodeHandle,
    pub uid: NodeUid,
    pub args: Vec<String>,
    pub thread: ThreadId,
    pub edges: Vec<EdgeSpec>,
    pub flush_registered: bool,
    pub input_valid: bool,
    pub is_source: bool,
    pub next_slot: u32,
    pub inputs: Vec<InputBinding>,
}

/// A registered source or monitor: the node that owns it, the record
/// type it emits, its input slot, and the outtype its emissions flow
/// through.
#[derive(Debug)]
pub struct SourceSpec {
    pub node: NodeId,
    pub dtype: TypeId,
    pub slot: u32,
    pub kind: SourceKind,
    pub out: OutType,
}

/// Strongly connected components of the thread-level digraph, the
/// precondition for communication deadlock.
#[derive(Clone, Debug, Default)]
pub struct CycleTopology {
    pub thread_in_cycle: Vec<bool>,
    pub sccs: Vec<Vec<u16>>,
}

impl CycleTopology {
    pub fn num_sccs(&self) -> usize {
        self.sccs.len()
    }
}

/// The graph compiler's output: everything the scheduler needs,
/// including the initialized node instances.
pub struct CompiledGraph {
    pub nodes: Vec<NodeSpec>,
    pub outlists: Vec<OutList>,
    pub subs: Vec<Subscriber>,
    pub flush_out: OutType,
    pub flush_order: Vec<SubId>,
    pub sources: Vec<SourceSpec>,
    pub work_size: u16,
    /// Dense thread id -> user-visible thread id from the config.
    pub user_tids: Vec<u32>,
    /// Which dense threads carry at least one source.
    pub src_threads: Vec<bool>,
    /// Distinct writer threads per consumer thread's inbound queue.
    pub writers: Vec<Vec<u16>>,
    pub cycles: Option<CycleTopology>,
    pub thread_cpu: Vec<Option<usize>>,
    pub instances: Vec<Option<Box<dyn Instance>>>,
    pub flush_dtype: TypeId,
    pub monitor_dtype: TypeId,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.nodes)
            .field("outlists", &self.outlists)
            .field("subs", &self.subs)
            .field("flush_out", &self.flush_out)
            .field("flush_order", &self.flush_order)
            .field("sources", &self.sources)
            .field("work_size", &self.work_size)
            .field("user_tids", &self.user_tids)
            .field("src_threads", &self.src_threads)
            .field("writers", &self.writers)
            .field("cycles", &self.cycles)
            .field("thread_cpu", &self.thread_cpu)
            .field("instances", &self.instances.len())
            .field("flush_dtype", &self.flush_dtype)
            .field("monitor_dtype", &self.monitor_dtype)
            .finish()
    }
}

impl CompiledGraph {
    pub fn outtype(&self, out: OutRef) -> &OutType {
        match out {
            OutRef::Node { node, index } => &self.outlists[node.index()].outtypes[index as usize],
            OutRef::Source(i) => &self.sources[i as usize].out,
            OutRef::Flush => &self.flush_out,
        }
    }

    pub fn outtype_mut(&mut self, out: OutRef) -> &mut OutType {
        match out {
            OutRef::Node { node, index } => {
                &mut self.outlists[node.index()].outtypes[index as usize]
            }
            OutRef::Source(i) => &mut self.sources[i as usize].out,
            OutRef::Flush => &mut self.flush_out,
        }
    }

    pub fn node_of_flush_sub(&self, sub: SubId) -> NodeId {
        self.subs[sub.index()].node
    }

    /// `(thread id, kid uid)` assignment in node order, used to check
    /// compile determinism.
    pub fn assignment(&self) -> Vec<(u16, u32)> {
        self.nodes
            .iter()
            .map(|n| (n.thread.0, n.uid.0))
            .collect()
    }
}
