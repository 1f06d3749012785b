//! `tag` attaches one or more labels to every record passing through.

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{OutList, OutRef};
use crate::module::{InitCtx, Instance, Module, ModuleStats, ProcHandler};
use crate::scheduler::Forwarder;
use sluice_types::dtype::TypeId;
use sluice_types::label::LabelId;
use sluice_types::types::Record;

pub struct Tag;

impl Module for Tag {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["label"]
    }

    fn init(&self, ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        if ctx.args.is_empty() {
            return Err(CompileError::BadArgument {
                node: ctx.handle.clone(),
                reason: "tag requires at least one label".into(),
            });
        }
        Ok(Box::new(TagInstance {
            names: ctx.args.to_vec(),
            labels: Vec::new(),
            out: None,
            stats: ModuleStats::default(),
        }))
    }
}

struct TagInstance {
    names: Vec<String>,
    labels: Vec<LabelId>,
    out: Option<OutRef>,
    stats: ModuleStats,
}

impl Instance for TagInstance {
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
        self.labels = self.names.iter().map(|n| env.labels.register(n)).collect();
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
        self.stats.processed += 1;
        let Some(outref) = self.out else {
            return 0;
        };
        let mut tagged = record.clone();
        for label in &self.labels {
            tagged.add_label(*label);
        }
        out.emit(outref, tagged);
        self.stats.emitted += 1;
        1
    }

    fn destroy(&mut self) -> ModuleStats {
        self.stats
    }
}
