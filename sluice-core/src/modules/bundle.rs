//! `bundle` groups records into one carrier record; `unbundle` splits
//! carriers back into their members. The compiler inserts both
//! implicitly for `@$var` decorations.

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

const DEFAULT_BUNDLE_SIZE: usize = 16;

pub struct Bundle;

impl Module for Bundle {
    fn name(&self) -> &'static str {
        "bundle"
    }

    fn init(&self, ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        let mut cap = DEFAULT_BUNDLE_SIZE;
        let mut iter = ctx.args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-n" {
                let value = iter.next().ok_or_else(|| CompileError::BadArgument {
                    node: ctx.handle.clone(),
                    reason: "-n requires a count".into(),
                })?;
                cap = value.parse().map_err(|_| CompileError::BadArgument {
                    node: ctx.handle.clone(),
                    reason: format!("bad bundle size `{value}`"),
                })?;
            }
        }
        Ok(Box::new(BundleInstance {
            cap: cap.max(1),
            buf: Vec::new(),
            out: None,
            stats: ModuleStats::default(),
        }))
    }
}

struct BundleInstance {
    cap: usize,
    buf: Vec<Record>,
    out: Option<OutRef>,
    stats: ModuleStats,
}

impl BundleInstance {
    fn emit_bundle(&mut self, out: &mut Forwarder) {
        if self.buf.is_empty() {
            return;
        }
        if let Some(outref) = self.out {
            let mut record = out.record(outref);
            record
                .fields_mut()
                .push(Field::Bundle(std::mem::take(&mut self.buf)));
            out.emit(outref, record);
            self.stats.emitted += 1;
        } else {
            self.buf.clear();
        }
    }
}

impl Instance for BundleInstance {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        self.out = Some(out.add_outtype(env.tuple_type(), None));
        if dtype == env.flush_type() {
            Some(FLUSH)
        } else {
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
        match handler {
            DATA => {
                self.stats.processed += 1;
                self.buf.push(record.clone());
                if self.buf.len() >= self.cap {
                    self.emit_bundle(out);
                }
                1
            }
            FLUSH => {
                self.emit_bundle(out);
                1
            }
            _ => 0,
        }
    }

    fn destroy(&mut self) -> ModuleStats {
        self.stats
    }
}

pub struct Unbundle;

impl Module for Unbundle {
    fn name(&self) -> &'static str {
        "unbundle"
    }

    fn init(&self, _ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        Ok(Box::new(UnbundleInstance {
            out: None,
            stats: ModuleStats::default(),
        }))
    }
}

struct UnbundleInstance {
    out: Option<OutRef>,
    stats: ModuleStats,
}

impl Instance for UnbundleInstance {
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
        self.out = Some(out.add_outtype(env.tuple_type(), None));
        Some(DATA)
    }

    fn process(
        &mut self,
        _handler: ProcHandler,
        record: &Record,
        out: &mut Forwarder,
        _slot: u32,
    ) -> usize {
        self.stats.processed += 1;
        let Some(outref) = self.out else {
            return 0;
        };
        let mut emitted = 0;
        let mut had_bundle = false;
        for field in record.fields() {
            if let Field::Bundle(members) = field {
                had_bundle = true;
                for member in members {
                    out.emit(outref, member.clone());
                    emitted += 1;
                }
            }
        }
        if !had_bundle {
            // Not a carrier; pass it through untouched.
            out.emit(outref, record.clone());
            emitted += 1;
        }
        self.stats.emitted += emitted as u64;
        emitted
    }

    fn destroy(&mut self) -> ModuleStats {
        self.stats
    }
}
