//! Shared test fixtures: small modules and AST builders used by the
//! end-to-end scenarios.

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{OutList, OutRef};
use crate::module::{InitCtx, Instance, Module, ModuleRegistry, ModuleStats, ProcHandler};
use crate::scheduler::Forwarder;
use sluice_types::ast::{NodeDef, Pipeline, Stmt, VarRef};
use sluice_types::dtype::TypeId;
use sluice_types::label::LabelId;
use sluice_types::parking_lot::Mutex;
use sluice_types::types::{Field, Record, RecordObserver};
use std::sync::Arc;

pub fn node(tokens: &[&str]) -> NodeDef {
    NodeDef::new(tokens)
}

pub fn var(name: &str) -> VarRef {
    VarRef::named(name)
}

pub fn var_filtered(name: &str, filter: &str) -> VarRef {
    VarRef {
        name: name.into(),
        filter: Some(filter.into()),
        port: None,
        bundled: false,
    }
}

pub fn pipeline(sources: Vec<VarRef>, nodes: Vec<NodeDef>, sinks: Vec<VarRef>) -> Stmt {
    Stmt::Pipeline(Pipeline {
        sources,
        nodes,
        sinks,
    })
}

pub fn thread_block(tid: u32, body: Vec<Stmt>) -> Stmt {
    Stmt::Thread {
        tid,
        two_d: false,
        body,
    }
}

pub fn registry_with(extra: Vec<Arc<dyn Module>>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::with_builtins();
    for module in extra {
        registry.register(module);
    }
    registry
}

/// Forwards every record untouched.
pub struct Passthrough;

impl Module for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn init(&self, _ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(PassthroughInstance { out: None }))
    }
}

struct PassthroughInstance {
    out: Option<OutRef>,
}

impl Instance for PassthroughInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.flush_type() {
            return None;
        }
        self.out = Some(out.add_outtype(dtype, None));
        Some(0)
    }

    fn process(
        &mut self,
        _handler: ProcHandler,
        record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        let Some(outref) = self.out else { return 0 };
        out.emit(outref, record.clone());
        1
    }
}

/// Tags records EVEN or ODD by the parity of their first field.
pub struct EvenOdd;

impl Module for EvenOdd {
    fn name(&self) -> &'static str {
        "even_odd"
    }

    fn init(&self, _ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(EvenOddInstance {
            out: None,
            even: None,
            odd: None,
        }))
    }
}

struct EvenOddInstance {
    out: Option<OutRef>,
    even: Option<LabelId>,
    odd: Option<LabelId>,
}

impl Instance for EvenOddInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.flush_type() {
            return None;
        }
        self.even = Some(env.labels.register("EVEN"));
        self.odd = Some(env.labels.register("ODD"));
        self.out = Some(out.add_outtype(dtype, None));
        Some(0)
    }

    fn process(
        &mut self,
        _handler: ProcHandler,
        record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        let Some(outref) = self.out else { return 0 };
        let value = record.fields().first().and_then(Field::as_uint).unwrap_or(0);
        let mut tagged = record.clone();
        let label = if value % 2 == 0 { self.even } else { self.odd };
        if let Some(label) = label {
            tagged.add_label(label);
        }
        out.emit(outref, tagged);
        1
    }
}

/// Terminal sink capturing first-field values and record observers.
pub struct Collect {
    pub values: Arc<Mutex<Vec<u64>>>,
    pub observers: Arc<Mutex<Vec<RecordObserver>>>,
}

impl Collect {
    pub fn new() -> (Arc<Mutex<Vec<u64>>>, Arc<Mutex<Vec<RecordObserver>>>, Self) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let observers = Arc::new(Mutex::new(Vec::new()));
        (
            values.clone(),
            observers.clone(),
            Self { values, observers },
        )
    }
}

impl Module for Collect {
    fn name(&self) -> &'static str {
        "collect_sink"
    }

    fn init(&self, _ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(CollectInstance {
            values: self.values.clone(),
            observers: self.observers.clone(),
        }))
    }
}

struct CollectInstance {
    values: Arc<Mutex<Vec<u64>>>,
    observers: Arc<Mutex<Vec<RecordObserver>>>,
}

impl Instance for CollectInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        _out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.flush_type() {
            return None;
        }
        Some(0)
    }

    fn process(
        &mut self,
        _handler: ProcHandler,
        record: &Record,
        _out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        if let Some(value) = record.fields().iter().find_map(Field::as_uint) {
            self.values.lock().push(value);
        }
        self.observers.lock().push(record.observe());
        1
    }
}

/// Cycle participant: stamps a hop budget on first sight, then
/// decrements it, emitting LIVE while budget remains and DONE when it
/// runs out.
pub struct Hop {
    pub budget: u64,
}

impl Module for Hop {
    fn name(&self) -> &'static str {
        "hop"
    }

    fn init(&self, _ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(HopInstance {
            budget: self.budget,
            out: None,
            live: None,
            done: None,
        }))
    }
}

struct HopInstance {
    budget: u64,
    out: Option<OutRef>,
    live: Option<LabelId>,
    done: Option<LabelId>,
}

impl Instance for HopInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.flush_type() {
            return None;
        }
        self.live = Some(env.labels.register("LIVE"));
        self.done = Some(env.labels.register("DONE"));
        self.out = Some(out.add_outtype(dtype, None));
        Some(0)
    }

    fn process(
        &mut self,
        _handler: ProcHandler,
        record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        let Some(outref) = self.out else { return 0 };
        let value = record.fields().first().and_then(Field::as_uint).unwrap_or(0);
        let ttl = record.fields().get(1).and_then(Field::as_uint);
        let (fields, label) = match ttl {
            None => (vec![Field::UInt(value), Field::UInt(self.budget)], self.live),
            Some(t) if t > 1 => (vec![Field::UInt(value), Field::UInt(t - 1)], self.live),
            Some(_) => (vec![Field::UInt(value)], self.done),
        };
        let mut emitted = Record::with_fields(record.dtype(), fields);
        if let Some(label) = label {
            emitted.add_label(label);
        }
        out.emit(outref, emitted);
        1
    }
}

/// Source emitting byte buffers, for exercising the buffer adapter.
pub struct BytesSource {
    pub bufs: Vec<Vec<u8>>,
}

impl Module for BytesSource {
    fn name(&self) -> &'static str {
        "bytes_source"
    }

    fn init(&self, ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        let out = ctx.sources.register_source(ctx.env.buffer_type());
        Ok(Box::new(BytesSourceInstance {
            bufs: self.bufs.clone(),
            next: 0,
            out,
        }))
    }
}

struct BytesSourceInstance {
    bufs: Vec<Vec<u8>>,
    next: usize,
    out: OutRef,
}

impl Instance for BytesSourceInstance {
    fn input_set(
        &mut self,
        _dtype: TypeId,
        _port: Option<LabelId>,
        _out: &mut OutList,
        _slot: u32,
        _env: &mut Env,
    ) -> Option<ProcHandler> {
        None
    }

    fn process(
        &mut self,
        _handler: ProcHandler,
        _record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        let Some(buf) = self.bufs.get(self.next) else {
            return 0;
        };
        let mut record = out.record(self.out);
        record.fields_mut().push(Field::Bytes(buf.clone()));
        out.emit(self.out, record);
        self.next += 1;
        1
    }
}

/// Terminal sink capturing byte buffers.
pub struct BytesCollect {
    pub bufs: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BytesCollect {
    pub fn new() -> (Arc<Mutex<Vec<Vec<u8>>>>, Self) {
        let bufs = Arc::new(Mutex::new(Vec::new()));
        (bufs.clone(), Self { bufs })
    }
}

impl Module for BytesCollect {
    fn name(&self) -> &'static str {
        "bytes_sink"
    }

    fn init(&self, _ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(BytesCollectInstance {
            bufs: self.bufs.clone(),
        }))
    }
}

struct BytesCollectInstance {
    bufs: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Instance for BytesCollectInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        _out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.flush_type() {
            return None;
        }
        Some(0)
    }

    fn process(
        &mut self,
        _handler: ProcHandler,
        record: &Record,
        _out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        for field in record.fields() {
            if let Field::Bytes(b) = field {
                self.bufs.lock().push(b.clone());
            }
        }
        1
    }
}

/// Buffers everything until flush, then replays it. Exercises the
/// ordered flush protocol.
pub struct BufferedPass;

impl Module for BufferedPass {
    fn name(&self) -> &'static str {
        "buffered_pass"
    }

    fn init(&self, _ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(BufferedPassInstance {
            buf: Vec::new(),
            out: None,
        }))
    }
}

struct BufferedPassInstance {
    buf: Vec<Record>,
    out: Option<OutRef>,
}

const DATA: ProcHandler = 0;
const FLUSH: ProcHandler = 1;

impl Instance for BufferedPassInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.flush_type() {
            self.out = Some(out.add_outtype(env.tuple_type(), None));
            Some(FLUSH)
        } else {
            self.out = Some(out.add_outtype(dtype, None));
            Some(DATA)
        }
    }

    fn process(
        &mut self,
        handler: ProcHandler,
        record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        let Some(outref) = self.out else { return 0 };
        match handler {
            DATA => {
                self.buf.push(record.clone());
                1
            }
            FLUSH => {
                let drained: Vec<Record> = std::mem::take(&mut self.buf);
                let count = drained.len();
                for rec in drained {
                    out.emit(outref, rec);
                }
                count
            }
            _ => 0,
        }
    }

    fn destroy(&mut self) -> ModuleStats {
        ModuleStats::default()
    }
}
