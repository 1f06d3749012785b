//! Graphviz rendering of the parse graph (`-G`) and the bound graph
//! (`-Z`). Thread contexts become cluster subgraphs; edges carry
//! `"src_label;port[THREAD]"` labels.

use super::ParseGraph;
use crate::env::Env;
use crate::graph::CompiledGraph;
use std::io::{self, Write};

fn edge_label(filter: &str, port: &str, thread: u16) -> String {
    format!("{filter};{port}[{thread}]")
}

pub fn parse_graph_dot<W: Write>(pg: &ParseGraph, w: &mut W) -> io::Result<()> {
    writeln!(w, "digraph sluice {{")?;
    for t in 0..pg.work_size {
        writeln!(w, "  subgraph cluster_thread{t} {{")?;
        writeln!(w, "    label = \"thread {}\";", pg.user_tids[t as usize])?;
        for (i, proc) in pg.procs.iter().enumerate() {
            if proc.thread.0 == t {
                writeln!(w, "    n{i} [label=\"{}\"];", proc.name)?;
            }
        }
        writeln!(w, "  }}")?;
    }
    for edge in &pg.edges {
        let label = edge_label(
            edge.filter.as_deref().unwrap_or(""),
            edge.port.as_deref().unwrap_or(""),
            pg.procs[edge.dst].thread.0,
        );
        writeln!(w, "  n{} -> n{} [label=\"{label}\"];", edge.src, edge.dst)?;
    }
    writeln!(w, "}}")
}

pub fn compiled_dot<W: Write>(g: &CompiledGraph, env: &Env, w: &mut W) -> io::Result<()> {
    writeln!(w, "digraph sluice {{")?;
    for t in 0..g.work_size {
        writeln!(w, "  subgraph cluster_thread{t} {{")?;
        writeln!(w, "    label = \"thread {}\";", g.user_tids[t as usize])?;
        for node in &g.nodes {
            if node.thread.0 == t {
                writeln!(w, "    n{} [label=\"{}\"];", node.id.0, node.handle)?;
            }
        }
        writeln!(w, "  }}")?;
    }
    for node in &g.nodes {
        for edge in &node.edges {
            let filter = edge.filter.map(|l| env.labels.name(l)).unwrap_or("");
            let port = edge.port.map(|l| env.labels.name(l)).unwrap_or("");
            let label = edge_label(filter, port, g.nodes[edge.dst.index()].thread.0);
            let style = if edge.crossing { ", style=dashed" } else { "" };
            writeln!(
                w,
                "  n{} -> n{} [label=\"{label}\"{style}];",
                node.id.0, edge.dst.0
            )?;
        }
    }
    writeln!(w, "}}")
}
