//! AST walk: thread contexts, inline function expansion, and bundle
//! rewriting. Produces a raw graph whose edges may still reference
//! stream variables.

use super::ParseProc;
use crate::errors::CompileError;
use crate::runtime::RuntimeOptions;
use sluice_types::ahash::AHashMap;
use sluice_types::ast::{FuncDecl, InPipe, NodeDef, Pipeline, Stmt};
use sluice_types::log::{debug, warn};
use sluice_types::node::ThreadId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum End {
    Proc(usize),
    Var(String),
}

#[derive(Clone, Debug)]
pub(crate) struct RawEdge {
    pub src: End,
    pub dst: End,
    pub filter: Option<String>,
    pub port: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct RawGraph {
    pub procs: Vec<ParseProc>,
    pub edges: Vec<RawEdge>,
}

struct Frame {
    prefix: String,
    map: AHashMap<String, String>,
}

struct Expander {
    funcs: AHashMap<String, FuncDecl>,
    func_counts: AHashMap<String, u32>,
    call_stack: Vec<String>,
    frames: Vec<Frame>,
    cur_tid: u32,
    max_tid: u32,
    graph: RawGraph,
    verbose: bool,
}

fn collect_funcs(stmts: &[Stmt], funcs: &mut AHashMap<String, FuncDecl>) {
    for stmt in stmts {
        match stmt {
            Stmt::List(inner) => collect_funcs(inner, funcs),
            Stmt::Thread { body, .. } => collect_funcs(body, funcs),
            Stmt::FuncDecl(decl) => {
                collect_funcs(&decl.body, funcs);
                funcs.insert(decl.name.clone(), decl.clone());
            }
            _ => {}
        }
    }
}

impl Expander {
    fn resolve_var(&mut self, name: &str) -> String {
        match self.frames.last_mut() {
            None => name.to_string(),
            Some(frame) => {
                if let Some(mapped) = frame.map.get(name) {
                    return mapped.clone();
                }
                // Variables local to a function body get a fresh name
                // per expansion so separate calls never cross streams.
                let mangled = format!("{}{}", frame.prefix, name);
                frame.map.insert(name.to_string(), mangled.clone());
                mangled
            }
        }
    }

    fn add_proc(&mut self, name: &str, args: Vec<String>, deprecated_pipe: bool) -> usize {
        if self.cur_tid > self.max_tid {
            self.max_tid = self.cur_tid;
        }
        self.graph.procs.push(ParseProc {
            name: name.to_string(),
            args,
            user_tid: self.cur_tid,
            thread: ThreadId(0),
            deprecated_pipe,
        });
        self.graph.procs.len() - 1
    }

    fn add_edge(&mut self, src: End, dst: End, filter: Option<String>, port: Option<String>) {
        self.graph.edges.push(RawEdge {
            src,
            dst,
            filter,
            port,
        });
    }

    fn walk(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            match stmt {
                Stmt::List(inner) => self.walk(inner)?,
                Stmt::Thread { tid, two_d, body } => {
                    if *two_d && self.verbose {
                        warn!("2D thread declarations are treated as plain thread blocks");
                    }
                    let saved = self.cur_tid;
                    self.cur_tid = *tid;
                    if self.cur_tid > self.max_tid {
                        self.max_tid = self.cur_tid;
                    }
                    self.walk(body)?;
                    self.cur_tid = saved;
                }
                Stmt::FuncDecl(_) => {}
                Stmt::FuncCall {
                    name,
                    sources,
                    dests,
                } => self.expand_call(name, sources, dests)?,
                Stmt::Pipeline(p) => self.lower_pipeline(p)?,
            }
        }
        Ok(())
    }

    fn expand_call(
        &mut self,
        name: &str,
        sources: &[String],
        dests: &[String],
    ) -> Result<(), CompileError> {
        let decl = self
            .funcs
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownFunction(name.to_string()))?;
        if self.call_stack.iter().any(|n| n == name) {
            return Err(CompileError::RecursiveFunction(name.to_string()));
        }
        if sources.len() != decl.sources.len() {
            return Err(CompileError::FunctionArity {
                name: name.to_string(),
                what: "source",
                got: sources.len(),
                want: decl.sources.len(),
            });
        }
        if dests.len() != decl.dests.len() {
            return Err(CompileError::FunctionArity {
                name: name.to_string(),
                what: "destination",
                got: dests.len(),
                want: decl.dests.len(),
            });
        }

        let version = {
            let count = self.func_counts.entry(name.to_string()).or_insert(0);
            let v = *count;
            *count += 1;
            v
        };
        debug!("expanding function `{name}` version {version}");

        // Parameters map onto the caller's streams, resolved in the
        // caller's own frame first.
        let mut map = AHashMap::new();
        for (param, arg) in decl.sources.iter().zip(sources) {
            let resolved = self.resolve_var(arg);
            map.insert(param.clone(), resolved);
        }
        for (param, arg) in decl.dests.iter().zip(dests) {
            let resolved = self.resolve_var(arg);
            map.insert(param.clone(), resolved);
        }
        self.frames.push(Frame {
            prefix: format!("{name}.{version}$"),
            map,
        });
        self.call_stack.push(name.to_string());
        let result = self.walk(&decl.body);
        self.call_stack.pop();
        self.frames.pop();
        result
    }

    fn lower_pipeline(&mut self, p: &Pipeline) -> Result<(), CompileError> {
        if p.nodes.is_empty() {
            if p.sources.is_empty() && p.sinks.is_empty() {
                return Ok(());
            }
            return Err(CompileError::EmptyPipeline);
        }

        // Source boundary. An `@$var` decoration inserts an implicit
        // unbundle node between the variable and the first real node.
        let mut prev: Vec<(End, Option<String>, Option<String>)> = Vec::new();
        for vr in &p.sources {
            let name = self.resolve_var(&vr.name);
            if vr.bundled {
                let ub = self.add_proc("unbundle", vec![], false);
                self.add_edge(End::Var(name), End::Proc(ub), vr.filter.clone(), None);
                prev.push((End::Proc(ub), None, vr.port.clone()));
            } else {
                prev.push((End::Var(name), vr.filter.clone(), vr.port.clone()));
            }
        }

        // A `||` break moves the rest of the pipeline onto a fresh
        // thread; the surrounding context resumes afterwards.
        let saved_tid = self.cur_tid;
        for nd in &p.nodes {
            let forced = nd.in_pipe == InPipe::DoublePipe;
            if forced {
                warn!("`||` is deprecated and will be removed; use an explicit thread block");
                self.cur_tid = self.max_tid + 1;
            }
            let idx = self.add_node_def(nd, forced);

            for (end, filter, port) in prev.drain(..) {
                let port = nd.source_port.clone().or(port);
                self.add_edge(end, End::Proc(idx), filter, port);
            }
            prev.push((End::Proc(idx), None, None));
        }

        // Sink boundary; `@$var` here inserts an implicit bundle node.
        for vr in &p.sinks {
            let name = self.resolve_var(&vr.name);
            if vr.bundled {
                let b = self.add_proc("bundle", vec![], false);
                for (end, _, _) in &prev {
                    self.add_edge(end.clone(), End::Proc(b), None, None);
                }
                self.add_edge(
                    End::Proc(b),
                    End::Var(name),
                    vr.filter.clone(),
                    vr.port.clone(),
                );
            } else {
                for (end, _, _) in &prev {
                    self.add_edge(
                        end.clone(),
                        End::Var(name.clone()),
                        vr.filter.clone(),
                        vr.port.clone(),
                    );
                }
            }
        }
        self.cur_tid = saved_tid;
        Ok(())
    }

    fn add_node_def(&mut self, nd: &NodeDef, deprecated_pipe: bool) -> usize {
        let name = nd.tokens.first().cloned().unwrap_or_default();
        let args = nd.tokens.iter().skip(1).cloned().collect();
        self.add_proc(&name, args, deprecated_pipe)
    }
}

pub(crate) fn expand(ast: &[Stmt], opts: &RuntimeOptions) -> Result<RawGraph, CompileError> {
    let mut funcs = AHashMap::new();
    collect_funcs(ast, &mut funcs);
    let mut expander = Expander {
        funcs,
        func_counts: AHashMap::new(),
        call_stack: Vec::new(),
        frames: Vec::new(),
        cur_tid: 0,
        max_tid: 0,
        graph: RawGraph::default(),
        verbose: opts.verbose,
    };
    expander.walk(ast)?;
    Ok(expander.graph)
}
