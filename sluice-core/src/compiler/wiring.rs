//! Subscriber wiring: a breadth-first walk from the sources that asks
//! each downstream node whether it accepts each upstream outtype,
//! builds the subscriber chains, records flush order, and tracks which
//! threads write into which shared queues.

use crate::env::Env;
use crate::errors::CompileError;
use crate::graph::{CompiledGraph, EdgeSpec, InputBinding, OutRef, SubId, Subscriber};
use crate::module::SourceKind;
use crate::runtime::RuntimeOptions;
use sluice_types::ahash::AHashSet;
use sluice_types::label::LabelId;
use sluice_types::log::debug;
use sluice_types::node::NodeId;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wired {
    /// The destination does not accept this input.
    None,
    /// A new `(type, port)` binding was created.
    New(SubId),
    /// The binding already existed; `Some` when a fresh subscriber was
    /// still attached, `None` when it would have duplicated one.
    Existing(Option<SubId>),
}

struct Wiring<'a> {
    g: &'a mut CompiledGraph,
    env: &'a mut Env,
    opts: &'a RuntimeOptions,
    writer_sets: Vec<AHashSet<u16>>,
}

pub(crate) fn wire(
    g: &mut CompiledGraph,
    env: &mut Env,
    opts: &RuntimeOptions,
) -> Result<(), CompileError> {
    let ws = g.work_size as usize;
    let mut wiring = Wiring {
        g,
        env,
        opts,
        writer_sets: vec![AHashSet::new(); ws],
    };
    wiring.wire_from_sources()?;
    wiring.wire_monitors()?;

    let writer_sets = wiring.writer_sets;
    for (t, set) in writer_sets.into_iter().enumerate() {
        let mut writers: Vec<u16> = set.into_iter().collect();
        writers.sort_unstable();
        g.writers[t] = writers;
    }

    if opts.input_validate {
        for node in &g.nodes {
            if !node.input_valid && !node.is_source {
                return Err(CompileError::NoValidInput(node.handle.clone()));
            }
        }
    }
    Ok(())
}

impl<'a> Wiring<'a> {
    fn wire_from_sources(&mut self) -> Result<(), CompileError> {
        let mut next = VecDeque::new();
        for i in 0..self.g.sources.len() {
            let (src_node, kind) = {
                let s = &self.g.sources[i];
                (s.node, s.kind)
            };
            if kind != SourceKind::Source {
                continue;
            }
            self.flush_register(src_node, None)?;
            let thread = self.g.nodes[src_node.index()].thread;
            self.g.src_threads[thread.index()] = true;

            let edges = self.g.nodes[src_node.index()].edges.clone();
            for edge in &edges {
                if matches!(
                    self.wire_input(
                        OutRef::Source(i as u32),
                        edge.port,
                        edge.filter,
                        edge.dst,
                        Some(src_node),
                        false,
                    )?,
                    Wired::New(_)
                ) {
                    next.push_back(edge.dst);
                }
                self.flush_register(edge.dst, Some(src_node))?;
            }
        }
        while let Some(dst) = next.pop_front() {
            self.wire_from_instance(dst)?;
        }
        Ok(())
    }

    /// Wires everything downstream of one node. Revisits terminate
    /// because an already-known `(type, port)` binding never re-enqueues
    /// its destination, so graphs with cycles converge.
    fn wire_from_instance(&mut self, src: NodeId) -> Result<(), CompileError> {
        self.flush_register(src, None)?;
        let mut next = VecDeque::new();
        let edges = self.g.nodes[src.index()].edges.clone();
        for edge in &edges {
            if self.wire_datatypes(src, edge)? > 0 {
                debug!(
                    "wired edge {} -> {}",
                    self.g.nodes[src.index()].handle,
                    self.g.nodes[edge.dst.index()].handle
                );
                next.push_back(edge.dst);
            }
            self.flush_register(edge.dst, Some(src))?;
        }
        while let Some(dst) = next.pop_front() {
            self.wire_from_instance(dst)?;
        }
        Ok(())
    }

    /// Offers every outtype `src` has declared to the consumer behind
    /// `edge`. Returns how many newly-accepted bindings resulted. The
    /// outtype list is re-measured each round because a self-edge can
    /// grow it mid-walk.
    fn wire_datatypes(&mut self, src: NodeId, edge: &EdgeSpec) -> Result<usize, CompileError> {
        let mut newly = 0;
        let mut index = 0;
        while index < self.g.outlists[src.index()].outtypes.len() {
            let key = OutRef::Node {
                node: src,
                index: index as u32,
            };
            if matches!(
                self.wire_input(key, edge.port, edge.filter, edge.dst, Some(src), false)?,
                Wired::New(_)
            ) {
                newly += 1;
            }
            index += 1;
        }
        Ok(newly)
    }

    fn wire_input(
        &mut self,
        key: OutRef,
        port: Option<LabelId>,
        filter: Option<LabelId>,
        dst: NodeId,
        src: Option<NodeId>,
        flushmon: bool,
    ) -> Result<Wired, CompileError> {
        let (dtype, out_label) = {
            let ot = self.g.outtype(key);
            match ot.dtype {
                Some(d) => (d, ot.label),
                None => return Ok(Wired::None),
            }
        };
        if filter.is_some() && out_label.is_some() && filter != out_label {
            debug!(
                "source-label filter does not match emission label on {}",
                self.g.nodes[dst.index()].handle
            );
        }

        let di = dst.index();
        let local = match src {
            None => true,
            Some(s) => self.g.nodes[s.index()].thread == self.g.nodes[di].thread,
        };

        // An existing (type, port) binding is reused without asking the
        // module again.
        if let Some(binding) = self.g.nodes[di]
            .inputs
            .iter()
            .find(|b| b.dtype == dtype && b.port == port)
            .cloned()
        {
            let sub = Subscriber {
                node: dst,
                thread: self.g.nodes[di].thread,
                handler: binding.handler,
                slot: binding.slot,
                port,
                filter,
                next: None,
            };
            let attached = self.attach_unique(key, sub, local, src)?;
            return Ok(Wired::Existing(attached));
        }

        let slot = self.g.nodes[di].next_slot;
        let handler = {
            let instance = self.g.instances[di].as_mut().expect("instance bound");
            let outlist = &mut self.g.outlists[di];
            instance.input_set(dtype, port, outlist, slot, self.env)
        };

        let Some(handler) = handler else {
            // No acceptance; a source node is still a valid graph
            // member without one.
            return Ok(Wired::None);
        };

        if !flushmon {
            self.g.nodes[di].input_valid = true;
        }
        self.g.nodes[di].next_slot += 1;
        self.g.nodes[di].inputs.push(InputBinding {
            dtype,
            port,
            handler,
            slot,
        });
        let sub = Subscriber {
            node: dst,
            thread: self.g.nodes[di].thread,
            handler,
            slot,
            port,
            filter,
            next: None,
        };
        let id = self.attach(key, sub, local, src);
        Ok(Wired::New(id))
    }

    /// Attaches unless an identical subscriber already sits on the
    /// chain.
    fn attach_unique(
        &mut self,
        key: OutRef,
        sub: Subscriber,
        local: bool,
        src: Option<NodeId>,
    ) -> Result<Option<SubId>, CompileError> {
        let head = {
            let ot = self.g.outtype(key);
            if local {
                ot.local_head
            } else {
                ot.ext_head
            }
        };
        let mut cur = head;
        while let Some(sid) = cur {
            let existing = &self.g.subs[sid.index()];
            if existing.node == sub.node
                && existing.handler == sub.handler
                && existing.slot == sub.slot
                && existing.port == sub.port
                && existing.filter == sub.filter
            {
                debug!("duplicate subscriber on {}", self.g.nodes[sub.node.index()].handle);
                return Ok(None);
            }
            cur = existing.next;
        }
        Ok(Some(self.attach(key, sub, local, src)))
    }

    fn attach(&mut self, key: OutRef, mut sub: Subscriber, local: bool, src: Option<NodeId>) -> SubId {
        if !local {
            if let Some(s) = src {
                let writer = self.g.nodes[s.index()].thread.0;
                let reader = sub.thread.index();
                self.writer_sets[reader].insert(writer);
            }
        }
        let id = SubId(self.g.subs.len() as u32);
        {
            let ot = self.g.outtype_mut(key);
            let head = if local {
                &mut ot.local_head
            } else {
                &mut ot.ext_head
            };
            sub.next = *head;
            *head = Some(id);
        }
        self.g.subs.push(sub);
        id
    }

    /// Registers `inst` as a flush subscriber on first encounter; on a
    /// re-encounter, moves it to the tail of the flush order so a node
    /// that might still receive data flushes after its feeders.
    fn flush_register(
        &mut self,
        inst: NodeId,
        src_inst: Option<NodeId>,
    ) -> Result<(), CompileError> {
        if !self.g.nodes[inst.index()].flush_registered {
            self.g.nodes[inst.index()].flush_registered = true;
            match self.wire_input(OutRef::Flush, None, None, inst, src_inst, true)? {
                Wired::New(id) | Wired::Existing(Some(id)) => {
                    if self.opts.verbose {
                        debug!(
                            "registered flusher on {}",
                            self.g.nodes[inst.index()].handle
                        );
                    }
                    self.g.flush_order.push(id);
                }
                _ => {
                    if self.opts.verbose {
                        debug!(
                            "no flusher registered on {}",
                            self.g.nodes[inst.index()].handle
                        );
                    }
                }
            }
            return Ok(());
        }

        let len = self.g.flush_order.len();
        if len <= 1 {
            return Ok(());
        }
        let last = self.g.flush_order[len - 1];
        if self.g.subs[last.index()].node == inst {
            return Ok(());
        }
        let Some(pos) = self
            .g
            .flush_order
            .iter()
            .position(|sid| self.g.subs[sid.index()].node == inst)
        else {
            // Seen before, but never registered a flusher.
            return Ok(());
        };
        let moved = self.g.flush_order.remove(pos);
        debug!(
            "flush order: moving {} to the end",
            self.g.nodes[inst.index()].handle
        );
        self.g.flush_order.push(moved);
        Ok(())
    }

    fn wire_monitors(&mut self) -> Result<(), CompileError> {
        for i in 0..self.g.sources.len() {
            let (mon_node, kind) = {
                let s = &self.g.sources[i];
                (s.node, s.kind)
            };
            if kind != SourceKind::Monitor {
                continue;
            }
            for n in 0..self.g.nodes.len() {
                self.wire_input(
                    OutRef::Source(i as u32),
                    None,
                    None,
                    NodeId(n as u32),
                    Some(mon_node),
                    true,
                )?;
            }
        }
        Ok(())
    }
}
