use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interned label identifier. Labels are looked up by name at
/// graph-compile time and compared by id thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process-wide label intern table.
///
/// Registration is idempotent: the same name always maps to the same id.
#[derive(Debug, Default)]
pub struct LabelRegistry {
    names: Vec<String>,
    index: AHashMap<String, LabelId>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> LabelId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = LabelId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<LabelId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: LabelId) -> &str {
        &self.names[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let mut reg = LabelRegistry::new();
        let a = reg.register("EVEN");
        let b = reg.register("ODD");
        assert_ne!(a, b);
        assert_eq!(reg.register("EVEN"), a);
        assert_eq!(reg.lookup("ODD"), Some(b));
        assert_eq!(reg.name(a), "EVEN");
        assert_eq!(reg.len(), 2);
    }
}
