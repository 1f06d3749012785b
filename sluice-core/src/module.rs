//! The contract plug-in nodes implement, and the registry that resolves
//! node names to modules.
//!
//! Module resolution is static by default: every module is an entry in
//! a process-wide registry of `(name, vtable)` pairs. Loading modules
//! from dynamic libraries stays behind the `dynamic-modules` feature.

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{OutList, OutRef};
use crate::scheduler::Forwarder;
use sluice_types::ahash::AHashMap;
use sluice_types::dtype::TypeId;
use sluice_types::label::LabelId;
use sluice_types::log::warn;
use sluice_types::node::{NodeHandle, NodeId, NodeUid, ThreadId};
use sluice_types::types::Record;
use std::sync::Arc;

/// Selector for the per-(type, port) processing path a module returned
/// from `input_set`. The scheduler passes it back on every `process`.
pub type ProcHandler = u32;

/// Handler value used when polling a registered source or monitor.
pub const SOURCE_HANDLER: ProcHandler = u32::MAX;

/// Per-node statistics reported at destroy time.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleStats {
    pub processed: u64,
    pub emitted: u64,
}

/// Whether a self-registration polls as a data source or a monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Source,
    Monitor,
}

/// Collects the source/monitor registrations a module makes during
/// `init`. Registration order fixes the poll order and the outtype
/// handles handed back to the module.
pub struct SourceRegistrar {
    node: NodeId,
    base: u32,
    pub(crate) regs: Vec<(TypeId, SourceKind)>,
}

impl SourceRegistrar {
    pub(crate) fn new(node: NodeId, base: u32) -> Self {
        Self {
            node,
            base,
            regs: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Registers this node as a source emitting `dtype`. The returned
    /// handle is what the node passes to the forwarder when emitting.
    pub fn register_source(&mut self, dtype: TypeId) -> OutRef {
        let out = OutRef::Source(self.base + self.regs.len() as u32);
        self.regs.push((dtype, SourceKind::Source));
        out
    }

    /// Registers this node as a monitor: polled like a source, but fed
    /// monitor-typed records and excluded from source exhaustion.
    pub fn register_monitor(&mut self, dtype: TypeId) -> OutRef {
        let out = OutRef::Source(self.base + self.regs.len() as u32);
        self.regs.push((dtype, SourceKind::Monitor));
        out
    }
}

/// Everything a module sees while initializing one node instance.
pub struct InitCtx<'a> {
    pub args: &'a [String],
    pub handle: &'a NodeHandle,
    pub uid: NodeUid,
    pub thread: ThreadId,
    pub env: &'a mut Env,
    pub sources: &'a mut SourceRegistrar,
}

/// A module: the compile-time-unknown implementation behind a node
/// name. One `Module` value serves every instance of that name.
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn deprecated(&self) -> bool {
        false
    }

    /// Phase-1 initialization: allocate per-node state, parse argv,
    /// optionally self-register as a source or monitor.
    fn init(&self, ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError>;
}

/// One bound node instance. Invoked only on its assigned thread (and,
/// after the flush collapse, on thread 0).
pub trait Instance: Send {
    /// Declares whether this node accepts records of `dtype` arriving
    /// on `port`, returning the processing handler for that pair and
    /// populating `out` with the outtypes the node may then emit.
    fn input_set(
        &mut self,
        dtype: TypeId,
        port: Option<LabelId>,
        out: &mut OutList,
        slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler>;

    /// Phase-2 initialization, after every node has completed phase 1
    /// and sharing has been verified.
    fn init_finish(&mut self, _env: &mut Env) -> Result<(), CompileError> {
        Ok(())
    }

    /// Handles one record. Sources are invoked with
    /// [`SOURCE_HANDLER`] and a fresh record of their registered type;
    /// a zero return from a source means it produced no data.
    fn process(
        &mut self,
        handler: ProcHandler,
        record: &Record,
        out: &mut Forwarder,
        slot: u32,
    ) -> usize;

    /// Teardown; runs once per instance at the end of the run.
    fn destroy(&mut self) -> ModuleStats {
        ModuleStats::default()
    }
}

/// Process-wide registry of modules and name aliases.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn Module>>,
    index: AHashMap<String, usize>,
    aliases: AHashMap<String, String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the modules shipped in-tree.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for module in crate::modules::builtin_modules() {
            reg.register(module);
        }
        reg
    }

    pub fn register(&mut self, module: Arc<dyn Module>) {
        let name = module.name().to_string();
        for alias in module.aliases() {
            self.aliases.insert(alias.to_string(), name.clone());
        }
        let idx = self.modules.len();
        if self.index.insert(name.clone(), idx).is_some() {
            warn!("module `{name}` registered twice; later registration wins");
        }
        self.modules.push(module);
    }

    /// Adds an external alias, e.g. from an alias-table file.
    pub fn add_alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Module>> {
        let name = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.index.get(name).map(|i| self.modules[*i].clone())
    }

    /// Loads a module from a dynamic library exporting
    /// `sluice_module_entry: extern "C" fn() -> *mut Arc<dyn Module>`.
    #[cfg(feature = "dynamic-modules")]
    pub fn load_dynamic(&mut self, path: &std::path::Path) -> Result<(), CompileError> {
        type Entry = unsafe extern "C" fn() -> *mut Arc<dyn Module>;
        unsafe {
            let lib = libloading::Library::new(path)
                .map_err(|e| CompileError::ModuleLoad(e.to_string()))?;
            let entry: libloading::Symbol<Entry> = lib
                .get(b"sluice_module_entry")
                .map_err(|e| CompileError::ModuleLoad(e.to_string()))?;
            let module = Box::from_raw(entry());
            self.register(*module);
            // The library must outlive every instance; it is
            // intentionally leaked, mirroring keep-loaded semantics.
            std::mem::forget(lib);
        }
        Ok(())
    }
}
