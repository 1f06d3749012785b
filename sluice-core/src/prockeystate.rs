//! Key-state adapter: per-key state updates backed by a registered
//! table, with share-label rendezvous and configurable gradual or batch
//! expiration. Transparent to the scheduler.

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{OutList, OutRef};
use crate::module::{InitCtx, Instance, Module, ModuleStats, ProcHandler};
use crate::scheduler::Forwarder;
use crate::tables::{KeyTable, StateTable, TableKind};
use sluice_types::dtype::{HashLocator, TypeId};
use sluice_types::label::LabelId;
use sluice_types::types::{Field, Record};
use std::sync::Arc;

const DATA: ProcHandler = 0;
const FLUSH: ProcHandler = 1;

/// When stored keys leave the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiration {
    /// Oldest entries leave one at a time as new keys arrive.
    Gradual,
    /// The whole table empties once it reaches capacity.
    Batch,
}

/// The narrowed contract a key-state module implements: the adapter
/// owns key extraction, the table, expiration, and flush emission.
pub trait KeyStateKid: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Updates per-key state for one record. Return `true` to forward
    /// the triggering record downstream.
    fn update(&self, state: &mut u64, record: &Record) -> bool;

    /// Label attached to state-emission records.
    fn emit_label(&self) -> Option<&'static str> {
        None
    }
}

/// Adapter turning a [`KeyStateKid`] into a [`Module`].
pub struct KeyStateModule<K> {
    kid: Arc<K>,
}

impl<K: KeyStateKid> KeyStateModule<K> {
    pub fn new(kid: K) -> Self {
        Self { kid: Arc::new(kid) }
    }
}

fn parse_args(
    args: &[String],
    ctx: &InitCtx,
) -> Result<(Option<String>, usize, Expiration), CompileError> {
    let mut share = None;
    let mut max = ctx.env.statestore_max;
    let mut expiration = Expiration::Gradual;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-J" => {
                share = Some(iter.next().cloned().ok_or_else(|| {
                    CompileError::BadArgument {
                        node: ctx.handle.clone(),
                        reason: "-J requires a share label".into(),
                    }
                })?);
            }
            "-M" => {
                let value = iter.next().ok_or_else(|| CompileError::BadArgument {
                    node: ctx.handle.clone(),
                    reason: "-M requires a record count".into(),
                })?;
                max = value.parse().map_err(|_| CompileError::BadArgument {
                    node: ctx.handle.clone(),
                    reason: format!("bad record count `{value}`"),
                })?;
            }
            "-g" => expiration = Expiration::Gradual,
            "-b" => expiration = Expiration::Batch,
            other => {
                return Err(CompileError::BadArgument {
                    node: ctx.handle.clone(),
                    reason: format!("unknown option `{other}`"),
                })
            }
        }
    }
    Ok((share, max, expiration))
}

impl<K: KeyStateKid> Module for KeyStateModule<K> {
    fn name(&self) -> &'static str {
        self.kid.name()
    }

    fn aliases(&self) -> &'static [&'static str] {
        self.kid.aliases()
    }

    fn init(&self, ctx: &mut InitCtx) -> Result<Box<dyn Instance>, CompileError> {
        let (share, max, expiration) = parse_args(ctx.args, ctx)?;
        let owner = ctx.handle.to_string();
        let seed = ctx.env.seed;
        let table = match &share {
            Some(label) => ctx.env.tables.register_shared(
                label,
                TableKind::ExactMatch,
                &owner,
                || Arc::new(KeyTable::new(max, seed, Some(label.clone()))),
            )?,
            None => {
                let table = Arc::new(KeyTable::new(max, seed, None));
                table.set_thread_safe(false);
                ctx.env
                    .tables
                    .register_local(TableKind::ExactMatch, &owner, table.clone());
                table
            }
        };
        Ok(Box::new(KeyStateInstance {
            kid: self.kid.clone(),
            table,
            max_records: max,
            expiration,
            locator: None,
            out: None,
            emit_label: None,
            stats: ModuleStats::default(),
        }))
    }
}

struct KeyStateInstance<K> {
    kid: Arc<K>,
    table: Arc<KeyTable>,
    max_records: usize,
    expiration: Expiration,
    locator: Option<HashLocator>,
    out: Option<OutRef>,
    emit_label: Option<LabelId>,
    stats: ModuleStats,
}

fn key_from(locator: HashLocator, record: &Record) -> Option<Vec<u8>> {
    let span = locator(record)?;
    let field = record.fields().get(span.field)?;
    let bytes = field.as_key_bytes();
    if span.offset >= bytes.len() {
        return None;
    }
    let end = (span.offset + span.len).min(bytes.len());
    Some(bytes[span.offset..end].to_vec())
}

impl<K: KeyStateKid> KeyStateInstance<K> {
    fn emit_state(&mut self, out: &mut Forwarder, key: &[u8], state: u64) {
        if let Some(outref) = self.out {
            let mut record = out.record(outref);
            if let Some(label) = self.emit_label {
                record.add_label(label);
            }
            record.fields_mut().push(Field::Bytes(key.to_vec()));
            record.fields_mut().push(Field::UInt(state));
            out.emit(outref, record);
            self.stats.emitted += 1;
        }
    }
}

impl<K: KeyStateKid> Instance for KeyStateInstance<K> {
    fn input_set(
        &mut self,
        dtype: TypeId,
        _port: Option<LabelId>,
        out: &mut OutList,
        _slot: u32,
        env: &mut Env,
    ) -> Option<ProcHandler> {
        if dtype == env.flush_type() {
            self.emit_label = self.kid.emit_label().map(|l| env.labels.register(l));
            self.out = Some(out.add_outtype(env.tuple_type(), None));
            return Some(FLUSH);
        }
        let locator = env.types.get(dtype).hash_locator?;
        self.locator = Some(locator);
        self.emit_label = self.kid.emit_label().map(|l| env.labels.register(l));
        self.out = Some(out.add_outtype(env.tuple_type(), None));
        Some(DATA)
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
                let Some(locator) = self.locator else {
                    return 0;
                };
                let Some(key) = key_from(locator, record) else {
                    return 0;
                };
                if self.expiration == Expiration::Batch && self.table.len() >= self.max_records {
                    let mut expired = Vec::new();
                    self.table.drain_all(|k, v| expired.push((k.to_vec(), v)));
                    for (k, v) in expired {
                        self.emit_state(out, &k, v);
                    }
                }
                let kid = self.kid.clone();
                let mut forward = false;
                let evicted = self.table.update(&key, |state| {
                    forward = kid.update(state, record);
                });
                if let Some((old_key, old_state)) = evicted {
                    if self.expiration == Expiration::Gradual {
                        self.emit_state(out, &old_key, old_state);
                    }
                }
                if forward {
                    if let Some(outref) = self.out {
                        out.emit(outref, record.clone());
                        self.stats.emitted += 1;
                    }
                }
                1
            }
            FLUSH => {
                let mut drained = Vec::new();
                self.table.drain_all(|k, v| drained.push((k.to_vec(), v)));
                let count = drained.len();
                for (k, v) in drained {
                    self.emit_state(out, &k, v);
                }
                count
            }
            _ => 0,
        }
    }

    fn destroy(&mut self) -> ModuleStats {
        self.stats
    }
}
