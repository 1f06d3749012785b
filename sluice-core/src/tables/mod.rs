//! State tables and the registry that coordinates sharing them across
//! nodes by label.

pub mod keytable;
pub mod registry;

pub use keytable::KeyTable;
pub use registry::TableRegistry;

/// What a hash-backed state structure answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Exact-match keyed state.
    ExactMatch,
    /// Approximate existence (bloom-style).
    Existence,
    /// Frequency estimation.
    Frequency,
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TableKind::ExactMatch => "exact",
            TableKind::Existence => "exist",
            TableKind::Frequency => "freq",
        };
        f.write_str(s)
    }
}

/// The registry-facing interface of a state table. The concrete
/// structures behind it (exact-match in-tree; probabilistic variants
/// externally) are interchangeable from the registry's point of view.
pub trait StateTable: Send + Sync {
    fn kind(&self) -> TableKind;
    fn mem_used(&self) -> u64;
    fn hash_seed(&self) -> u32;
    fn expire_count(&self) -> u64;
    /// Whether cross-thread synchronization is engaged. Cleared by the
    /// registry when post-compile verification demotes a share of one.
    fn thread_safe(&self) -> bool;
    fn set_thread_safe(&self, on: bool);
}
