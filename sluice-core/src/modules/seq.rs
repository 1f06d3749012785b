//! `seq` is a source emitting an integer sequence, one record per poll
//! (or the whole range at once with `-b`).

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{OutList, OutRef};
use crate::module::{InitCtx, Instance, Module, ModuleStats, ProcHandler, SOURCE_HANDLER};
use crate::scheduler::Forwarder;
use sluice_types::dtype::TypeId;
use sluice_types::label::LabelId;
use sluice_types::types::{Field, Record};

pub struct Seq;

impl Module for Seq {
    fn name(&self) -> &'static str {
        "seq"
    }

    fn init(&self, ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        let mut count = 10u64;
        let mut burst = false;
        let mut iter = ctx.args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-n" => {
                    let value = iter.next().ok_or_else(|| CompileError::BadArgument {
                        node: ctx.handle.clone(),
                        reason: "-n requires a count".into(),
                    })?;
                    count = value.parse().map_err(|_| CompileError::BadArgument {
                        node: ctx.handle.clone(),
                        reason: format!("bad count `{value}`"),
                    })?;
                }
                "-b" => burst = true,
                other => {
                    return Err(CompileError::BadArgument {
                        node: ctx.handle.clone(),
                        reason: format!("unknown option `{other}`"),
                    })
                }
            }
        }
        let out = ctx.sources.register_source(ctx.env.tuple_type());
        Ok(Box::new(SeqInstance {
            next: 0,
            count,
            burst,
            out,
            stats: ModuleStats::default(),
        }))
    }
}

struct SeqInstance {
    next: u64,
    count: u64,
    burst: bool,
    out: OutRef,
    stats: ModuleStats,
}

impl SeqInstance {
    fn emit_one(&mut self, out: &mut Forwarder) {
        let mut record = out.record(self.out);
        record.fields_mut().push(Field::UInt(self.next));
        out.emit(self.out, record);
        self.next += 1;
        self.stats.emitted += 1;
    }
}

impl Instance for SeqInstance {
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
        handler: ProcHandler,
        _record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        if handler != SOURCE_HANDLER || self.next >= self.count {
            return 0;
        }
        if self.burst {
            let mut emitted = 0;
            while self.next < self.count {
                self.emit_one(out);
                emitted += 1;
            }
            emitted
        } else {
            self.emit_one(out);
            1
        }
    }

    fn destroy(&mut self) -> ModuleStats {
        self.stats
    }
}
