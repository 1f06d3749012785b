use sluice_types::node::NodeHandle;
use sluice_types::thiserror::Error;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("unknown module for node `{0}`")]
    UnknownModule(String),
    #[error("recursive call to function `{0}`")]
    RecursiveFunction(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("function `{name}` called with {got} {what} streams, declared with {want}")]
    FunctionArity {
        name: String,
        what: &'static str,
        got: usize,
        want: usize,
    },
    #[error("undefined stream variable `{0}`")]
    UndefinedVariable(String),
    #[error("pipeline connects variables with no processing node in between")]
    EmptyPipeline,
    #[error("graph has no processing nodes")]
    EmptyGraph,
    #[error("no valid input to node `{0}`")]
    NoValidInput(NodeHandle),
    #[error("module init failed for `{node}`: {reason}")]
    ModuleInit { node: NodeHandle, reason: String },
    #[error("bad module argument for `{node}`: {reason}")]
    BadArgument { node: NodeHandle, reason: String },
    #[error(transparent)]
    Table(#[from] TableError),
    #[cfg(feature = "dynamic-modules")]
    #[error("cannot load module library: {0}")]
    ModuleLoad(String),
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("exit flush aborted")]
    FlushAborted,
    #[error("worker thread panicked")]
    WorkerPanic,
    #[error("cannot spawn worker thread: {0}")]
    CannotSpawnWorkerThread(#[from] std::io::Error),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

#[derive(Error, Debug)]
pub enum TableError {
    #[error("share label `{label}` already registered as a {existing:?} table")]
    KindMismatch {
        label: String,
        existing: crate::tables::TableKind,
    },
    #[error("bad table image: {0}")]
    BadImage(String),
    #[error("short read in table image")]
    ShortImage,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
