use crate::tables::registry::TableRegistry;
use sluice_types::ahash::AHashMap;
use sluice_types::dtype::{
    KeySpan, TypeId, TypeRegistry, BUFFER_TYPE, FLUSH_TYPE, MONITOR_TYPE, TUPLE_TYPE,
};
use sluice_types::label::LabelRegistry;
use sluice_types::types::Record;
use std::any::Any;
use std::sync::Arc;

/// Default cap on records held by a hash-backed state table, overridden
/// by `SLUICE_STATESTORE_MAX`.
pub const DEFAULT_STATESTORE_MAX: usize = 1 << 18;

fn first_field_locator(rec: &Record) -> Option<KeySpan> {
    let field = rec.fields().first()?;
    Some(KeySpan {
        field: 0,
        offset: 0,
        len: field.as_key_bytes().len(),
    })
}

/// Rendezvous store by which two modules in the same graph share a
/// value by agreeing on a label string, without either knowing which
/// one created it. `get` and `put` both count the caller as a sharer;
/// `unshare` reports how many sharers remain so the last one out can
/// tear the value down.
#[derive(Default)]
pub struct ShareStore {
    slots: AHashMap<String, ShareSlot>,
}

struct ShareSlot {
    count: u32,
    value: Arc<dyn Any + Send + Sync>,
}

impl ShareStore {
    pub fn get(&mut self, label: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        if label.is_empty() {
            return None;
        }
        let slot = self.slots.get_mut(label)?;
        slot.count += 1;
        Some(slot.value.clone())
    }

    pub fn put(&mut self, label: &str, value: Arc<dyn Any + Send + Sync>) -> bool {
        if label.is_empty() {
            return false;
        }
        let slot = self
            .slots
            .entry(label.to_string())
            .or_insert_with(|| ShareSlot {
                count: 0,
                value: value.clone(),
            });
        slot.count += 1;
        slot.value = value;
        true
    }

    /// Returns the sharer count after removal; 0 means the caller was
    /// the last user. Negative-style errors from the original are
    /// expressed as `None`.
    pub fn unshare(&mut self, label: &str) -> Option<u32> {
        if label.is_empty() {
            return None;
        }
        let slot = self.slots.get_mut(label)?;
        slot.count = slot.count.saturating_sub(1);
        Some(slot.count)
    }
}

/// Process context handed to modules at compile time: label and type
/// registries, the state-table registry, and the share rendezvous.
pub struct Env {
    pub labels: LabelRegistry,
    pub types: TypeRegistry,
    pub tables: Arc<TableRegistry>,
    pub shares: ShareStore,
    pub seed: u32,
    pub statestore_max: usize,
    tuple_type: TypeId,
    buffer_type: TypeId,
    flush_type: TypeId,
    monitor_type: TypeId,
}

impl Env {
    pub fn new(seed: u32, statestore_max: usize) -> Self {
        let labels = LabelRegistry::new();
        let mut types = TypeRegistry::new();
        let tuple_type = types.register(TUPLE_TYPE, vec![], Some(first_field_locator));
        let buffer_type = types.register(BUFFER_TYPE, vec![], Some(first_field_locator));
        let flush_type = types.register(FLUSH_TYPE, vec![], None);
        let monitor_type = types.register(MONITOR_TYPE, vec![], None);
        Self {
            labels,
            types,
            tables: Arc::new(TableRegistry::new()),
            shares: ShareStore::default(),
            seed,
            statestore_max,
            tuple_type,
            buffer_type,
            flush_type,
            monitor_type,
        }
    }

    pub fn tuple_type(&self) -> TypeId {
        self.tuple_type
    }

    pub fn buffer_type(&self) -> TypeId {
        self.buffer_type
    }

    pub fn flush_type(&self) -> TypeId {
        self.flush_type
    }

    pub fn monitor_type(&self) -> TypeId {
        self.monitor_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_store_counts_sharers() {
        let mut store = ShareStore::default();
        assert!(store.get("tbl").is_none());
        assert!(store.put("tbl", Arc::new(7u64)));
        let v = store.get("tbl").unwrap();
        assert_eq!(*v.downcast::<u64>().unwrap(), 7);
        assert_eq!(store.unshare("tbl"), Some(1));
        assert_eq!(store.unshare("tbl"), Some(0));
    }

    #[test]
    fn env_registers_core_types() {
        let env = Env::new(0, DEFAULT_STATESTORE_MAX);
        assert_eq!(env.types.lookup(TUPLE_TYPE), Some(env.tuple_type()));
        assert_eq!(env.types.lookup(FLUSH_TYPE), Some(env.flush_type()));
        assert_ne!(env.tuple_type(), env.flush_type());
    }
}
