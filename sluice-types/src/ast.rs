//! Output contract of the external surface-syntax parser.
//!
//! The parser hands the runtime this tree (serialized as JSON when it
//! crosses a process boundary). The parser guarantees that every
//! referenced function is declared, that every variable consumed
//! somewhere is produced somewhere, and that filters and ports are bare
//! identifiers; the compiler does not re-verify those properties.

use serde::{Deserialize, Serialize};

/// How a node definition was joined to its predecessor in the config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InPipe {
    None,
    /// `|`: stays on the current thread context.
    Pipe,
    /// `||`: forces a fresh thread id. Deprecated surface syntax.
    DoublePipe,
}

/// A stream-variable reference at a pipeline boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRef {
    pub name: String,
    /// Source-side filter label: the edge is taken only when the record
    /// bears this label.
    #[serde(default)]
    pub filter: Option<String>,
    /// Input-port label on the consumer side.
    #[serde(default)]
    pub port: Option<String>,
    /// `@$var` decoration: bundling requested at this boundary.
    #[serde(default)]
    pub bundled: bool,
}

impl VarRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
            port: None,
            bundled: false,
        }
    }
}

/// One processing-node definition: module name and arguments as written,
/// plus how it was piped into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    /// `tokens[0]` is the module name, the rest its argv.
    pub tokens: Vec<String>,
    #[serde(default)]
    pub source_port: Option<String>,
    pub in_pipe: InPipe,
}

impl NodeDef {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            source_port: None,
            in_pipe: InPipe::None,
        }
    }
}

/// One pipeline: source variables feeding a node chain feeding sink
/// variables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub sources: Vec<VarRef>,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub sinks: Vec<VarRef>,
}

/// A function declaration: a reusable subgraph with named source and
/// destination stream parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncDecl {
    pub name: String,
    pub sources: Vec<String>,
    pub dests: Vec<String>,
    pub body: Vec<Stmt>,
}

/// A statement in the config tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    List(Vec<Stmt>),
    Thread {
        tid: u32,
        /// Grid thread declaration in the legacy surface syntax.
        #[serde(default)]
        two_d: bool,
        body: Vec<Stmt>,
    },
    FuncDecl(FuncDecl),
    FuncCall {
        name: String,
        sources: Vec<String>,
        dests: Vec<String>,
    },
    Pipeline(Pipeline),
}

impl Stmt {
    /// Convenience constructor for a straight-line pipeline with no
    /// stream variables.
    pub fn pipeline(nodes: Vec<NodeDef>) -> Self {
        Stmt::Pipeline(Pipeline {
            sources: vec![],
            nodes,
            sinks: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ast_round_trips_through_json() {
        let stmt = Stmt::Thread {
            tid: 1,
            two_d: false,
            body: vec![Stmt::Pipeline(Pipeline {
                sources: vec![VarRef {
                    name: "in".into(),
                    filter: Some("EVEN".into()),
                    port: None,
                    bundled: false,
                }],
                nodes: vec![NodeDef::new(&["count", "-J", "shared"])],
                sinks: vec![VarRef::named("out")],
            })],
        };
        let json = serde_json::to_string(&stmt).unwrap();
        let back: Stmt = serde_json::from_str(&json).unwrap();
        assert_eq!(stmt, back);
    }
}
