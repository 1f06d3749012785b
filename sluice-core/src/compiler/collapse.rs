//! Variable collapse: every incoming edge to a stream variable is
//! joined with every outgoing edge from it, so the runtime only ever
//! sees node-to-node edges.

use super::expand::{End, RawGraph};
use super::{ParseEdge, ParseGraph};
use crate::errors::CompileError;
use sluice_types::ahash::AHashMap;

pub(crate) fn collapse(raw: RawGraph) -> Result<ParseGraph, CompileError> {
    let mut producers: AHashMap<&str, Vec<usize>> = AHashMap::new();
    let mut consumers: AHashMap<&str, Vec<usize>> = AHashMap::new();

    for (i, edge) in raw.edges.iter().enumerate() {
        if let End::Var(name) = &edge.dst {
            producers.entry(name.as_str()).or_default().push(i);
        }
        if let End::Var(name) = &edge.src {
            consumers.entry(name.as_str()).or_default().push(i);
        }
    }

    // Every consumed variable must be produced somewhere.
    for (name, _) in consumers.iter() {
        if !producers.contains_key(name) {
            return Err(CompileError::UndefinedVariable(name.to_string()));
        }
    }

    let mut edges = Vec::new();
    for edge in &raw.edges {
        match (&edge.src, &edge.dst) {
            (End::Proc(src), End::Proc(dst)) => edges.push(ParseEdge {
                src: *src,
                dst: *dst,
                filter: edge.filter.clone(),
                port: edge.port.clone(),
            }),
            (End::Proc(src), End::Var(name)) => {
                // Join with every consumer of this variable. The
                // consumer-side filter and port win over producer-side
                // decorations.
                for ci in consumers.get(name.as_str()).map(Vec::as_slice).unwrap_or(&[]) {
                    let cons = &raw.edges[*ci];
                    let dst = match &cons.dst {
                        End::Proc(d) => *d,
                        End::Var(n) => {
                            return Err(CompileError::UndefinedVariable(n.clone()));
                        }
                    };
                    edges.push(ParseEdge {
                        src: *src,
                        dst,
                        filter: cons.filter.clone().or_else(|| edge.filter.clone()),
                        port: cons.port.clone().or_else(|| edge.port.clone()),
                    });
                }
            }
            // Variable-to-anything edges are handled from the producer
            // side above.
            (End::Var(_), _) => {}
        }
    }

    Ok(ParseGraph {
        procs: raw.procs,
        edges,
        user_tids: Vec::new(),
        work_size: 0,
    })
}
