use crate::label::LabelId;
use crate::types::{Field, Record};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable data-type identifier assigned at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Location of the keying bytes within a record: which field, and the
/// byte span inside that field's encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeySpan {
    pub field: usize,
    pub offset: usize,
    pub len: usize,
}

pub type HashLocator = fn(&Record) -> Option<KeySpan>;

/// A registered data type: name, subelement schema, and an optional
/// hash locator used by key-state consumers.
pub struct DataType {
    pub name: String,
    pub id: TypeId,
    /// Label attached to each field position, if any.
    pub schema: Vec<Option<LabelId>>,
    pub hash_locator: Option<HashLocator>,
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataType")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("has_locator", &self.hash_locator.is_some())
            .finish()
    }
}

impl DataType {
    /// Extracts the key bytes of `rec` using this type's hash locator.
    pub fn key_of(&self, rec: &Record) -> Option<Vec<u8>> {
        let locator = self.hash_locator?;
        let span = locator(rec)?;
        let field = rec.fields().get(span.field)?;
        let bytes = field.as_key_bytes();
        if span.offset >= bytes.len() {
            return None;
        }
        let end = (span.offset + span.len).min(bytes.len());
        Some(bytes[span.offset..end].to_vec())
    }
}

/// Names of the types every runtime registers at startup.
pub const TUPLE_TYPE: &str = "TUPLE";
pub const BUFFER_TYPE: &str = "BUFFER";
pub const FLUSH_TYPE: &str = "FLUSH";
pub const MONITOR_TYPE: &str = "MONITOR";

/// Process-wide data-type table, discovered at startup.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<DataType>,
    index: AHashMap<String, TypeId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type under `name`. Re-registering a name returns the
    /// id of the existing type.
    pub fn register(
        &mut self,
        name: &str,
        schema: Vec<Option<LabelId>>,
        hash_locator: Option<HashLocator>,
    ) -> TypeId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(DataType {
            name: name.to_string(),
            id,
            schema,
            hash_locator,
        });
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: TypeId) -> &DataType {
        &self.types[id.0 as usize]
    }

    pub fn name(&self, id: TypeId) -> &str {
        &self.types[id.0 as usize].name
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_field_locator(rec: &Record) -> Option<KeySpan> {
        let len = rec.fields().first()?.as_key_bytes().len();
        Some(KeySpan {
            field: 0,
            offset: 0,
            len,
        })
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = TypeRegistry::new();
        let t = reg.register(TUPLE_TYPE, vec![], None);
        assert_eq!(reg.lookup(TUPLE_TYPE), Some(t));
        assert_eq!(reg.register(TUPLE_TYPE, vec![], None), t);
        assert_eq!(reg.name(t), TUPLE_TYPE);
    }

    #[test]
    fn key_extraction_follows_locator() {
        let mut reg = TypeRegistry::new();
        let t = reg.register("KEYED", vec![None], Some(first_field_locator));
        let rec = Record::with_fields(t, vec![Field::Str("alpha".into())]);
        assert_eq!(reg.get(t).key_of(&rec), Some(b"alpha".to_vec()));
    }
}
