//! Buffer-processing adapter: wraps a byte-buffer-in, byte-buffer-out
//! callback set into the generic module contract. Transparent to the
//! scheduler.

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{OutList, OutRef};
use crate::module::{InitCtx, Instance, Module, ModuleStats, ProcHandler};
use crate::scheduler::Forwarder;
use sluice_types::dtype::TypeId;
use sluice_types::label::LabelId;
use sluice_types::types::{Field, Record};

const DATA: ProcHandler = 0;
const FLUSH: ProcHandler = 1;

/// The narrowed contract a buffer module implements.
pub trait BufferKid: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Forward records whose buffers this module declines.
    fn pass_not_found(&self) -> bool {
        false
    }

    fn init(&self, args: &[String]) -> Result<Box<dyn BufferState>, CompileError>;
}

/// Per-instance state of a buffer module.
pub trait BufferState: Send {
    /// Transforms one buffer; `None` declines it.
    fn decode(&mut self, buf: &[u8]) -> Option<Vec<u8>>;

    /// Emits buffered state at flush time.
    fn flush(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Adapter turning a [`BufferKid`] into a [`Module`].
pub struct BufferModule<B> {
    kid: B,
}

impl<B: BufferKid> BufferModule<B> {
    pub fn new(kid: B) -> Self {
        Self { kid }
    }
}

impl<B: BufferKid> Module for BufferModule<B> {
    fn name(&self) -> &'static str {
        self.kid.name()
    }

    fn aliases(&self) -> &'static [&'static str] {
        self.kid.aliases()
    }

    fn init(&self, ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(BufferInstance {
            state: self.kid.init(ctx.args)?,
            pass_not_found: self.kid.pass_not_found(),
            out: None,
            stats: ModuleStats::default(),
        }))
    }
}

struct BufferInstance {
    state: Box<dyn BufferState>,
    pass_not_found: bool,
    out: Option<OutRef>,
    stats: ModuleStats,
}

impl BufferInstance {
    fn emit_buffer(&mut self, out: &mut Forwarder, buf: Vec<u8>) {
        if let Some(outref) = self.out {
            let mut record = out.record(outref);
            record.fields_mut().push(Field::Bytes(buf));
            out.emit(outref, record);
            self.stats.emitted += 1;
        }
    }
}

impl Instance for BufferInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.buffer_type() {
            self.out = Some(out.add_outtype(env.buffer_type(), None));
            Some(DATA)
        } else if dtype == env.flush_type() {
            self.out = Some(out.add_outtype(env.buffer_type(), None));
            Some(FLUSH)
        } else {
            None
        }
    }

    fn process(
        &mut self,
        handler: ProcHandler,
        record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        match handler {
            DATA => {
                self.stats.processed += 1;
                let buf = record.fields().iter().find_map(|f| match f {
                    Field::Bytes(b) => Some(b.clone()),
                    _ => None,
                });
                let Some(buf) = buf else {
                    return 0;
                };
                match self.state.decode(&buf) {
                    Some(decoded) => {
                        self.emit_buffer(out, decoded);
                        1
                    }
                    None if self.pass_not_found => {
                        if let Some(outref) = self.out {
                            out.emit(outref, record.clone());
                            self.stats.emitted += 1;
                        }
                        1
                    }
                    None => 0,
                }
            }
            FLUSH => {
                if let Some(buf) = self.state.flush() {
                    self.emit_buffer(out, buf);
                    1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn destroy(&mut self) -> ModuleStats {
        self.stats
    }
}
