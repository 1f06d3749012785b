//! Central ledger of shared and thread-local state tables.
//!
//! Two modules in the same graph share a table by agreeing on a label:
//! the first `register_shared` call creates the share descriptor, later
//! calls bump its reference count and hand back the existing table.
//! After compile, `verify_sharing` demotes any share that ended up with
//! a single user so it stops paying synchronization costs.

use super::{StateTable, TableKind};
use crate::errors::TableError;
use sluice_types::log::info;
use sluice_types::parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

struct SharedRow {
    label: String,
    kind: TableKind,
    owner: String,
    refs: u32,
    table: Arc<dyn StateTable>,
    any: Arc<dyn Any + Send + Sync>,
}

struct LocalRow {
    kind: TableKind,
    owner: String,
    table: Arc<dyn StateTable>,
}

#[derive(Default)]
struct Inner {
    shared: Vec<SharedRow>,
    local: Vec<LocalRow>,
}

/// Snapshot of one share descriptor, for reporting and tests.
#[derive(Clone, Debug)]
pub struct ShareInfo {
    pub label: String,
    pub kind: TableKind,
    pub owner: String,
    pub refs: u32,
    pub mem_used: u64,
    pub hash_seed: u32,
    pub thread_safe: bool,
}

#[derive(Default)]
pub struct TableRegistry {
    inner: Mutex<Inner>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or joins) the share named `label`. `make` runs only
    /// for the first registration.
    pub fn register_shared<T, F>(
        &self,
        label: &str,
        kind: TableKind,
        owner: &str,
        make: F,
    ) -> Result<Arc<T>, TableError>
    where
        T: StateTable + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.shared.iter_mut().find(|r| r.label == label) {
            if row.kind != kind {
                return Err(TableError::KindMismatch {
                    label: label.to_string(),
                    existing: row.kind,
                });
            }
            row.refs += 1;
            let any = row.any.clone();
            return any.downcast::<T>().map_err(|_| TableError::KindMismatch {
                label: label.to_string(),
                existing: kind,
            });
        }
        let table = make();
        inner.shared.push(SharedRow {
            label: label.to_string(),
            kind,
            owner: owner.to_string(),
            refs: 1,
            table: table.clone(),
            any: table.clone(),
        });
        Ok(table)
    }

    pub fn register_local(&self, kind: TableKind, owner: &str, table: Arc<dyn StateTable>) {
        self.inner.lock().local.push(LocalRow {
            kind,
            owner: owner.to_string(),
            table,
        });
    }

    /// Post-compile pass on the main thread: every share with a single
    /// user is demoted to a local table and its synchronization
    /// released, so an accidental "share of one" pays nothing.
    /// Returns the number of demotions.
    pub fn verify_sharing(&self) -> usize {
        let mut inner = self.inner.lock();
        info!("verifying shared state tables");
        let mut demoted = 0;
        let mut i = 0;
        while i < inner.shared.len() {
            if inner.shared[i].refs <= 1 {
                let row = inner.shared.remove(i);
                row.table.set_thread_safe(false);
                info!(
                    "demoting share `{}` ({} table from {}) to thread-local",
                    row.label, row.kind, row.owner
                );
                inner.local.push(LocalRow {
                    kind: row.kind,
                    owner: row.owner,
                    table: row.table,
                });
                demoted += 1;
            } else {
                i += 1;
            }
        }
        demoted
    }

    pub fn shared_info(&self) -> Vec<ShareInfo> {
        self.inner
            .lock()
            .shared
            .iter()
            .map(|r| ShareInfo {
                label: r.label.clone(),
                kind: r.kind,
                owner: r.owner.clone(),
                refs: r.refs,
                mem_used: r.table.mem_used(),
                hash_seed: r.table.hash_seed(),
                thread_safe: r.table.thread_safe(),
            })
            .collect()
    }

    pub fn shared_count(&self) -> usize {
        self.inner.lock().shared.len()
    }

    pub fn local_count(&self) -> usize {
        self.inner.lock().local.len()
    }

    /// Teardown report: one line per table plus its expiration count.
    /// `level` 0 is silent, matching the default CLI behavior.
    pub fn summary(&self, level: u8) {
        if level == 0 {
            return;
        }
        let inner = self.inner.lock();
        info!(
            "state tables: {} shared, {} local",
            inner.shared.len(),
            inner.local.len()
        );
        for row in &inner.shared {
            info!(
                "  shared {} `{}` owner {} refs {} mem {} seed {:#x} expired {}",
                row.kind,
                row.label,
                row.owner,
                row.refs,
                row.table.mem_used(),
                row.table.hash_seed(),
                row.table.expire_count()
            );
        }
        for row in &inner.local {
            info!(
                "  local {} owner {} mem {} seed {:#x} expired {}",
                row.kind,
                row.owner,
                row.table.mem_used(),
                row.table.hash_seed(),
                row.table.expire_count()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::KeyTable;

    #[test]
    fn shared_rendezvous_returns_one_table() {
        let reg = TableRegistry::new();
        let a = reg
            .register_shared("counts", TableKind::ExactMatch, "count.0", || {
                Arc::new(KeyTable::new(64, 1, Some("counts".into())))
            })
            .unwrap();
        let b = reg
            .register_shared("counts", TableKind::ExactMatch, "count.1", || {
                unreachable!("second registration must reuse the table")
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let info = &reg.shared_info()[0];
        assert_eq!(info.refs, 2);
        assert!(info.thread_safe);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let reg = TableRegistry::new();
        reg.register_shared("x", TableKind::ExactMatch, "a.0", || {
            Arc::new(KeyTable::new(64, 0, None))
        })
        .unwrap();
        let err = reg.register_shared::<KeyTable, _>("x", TableKind::Existence, "b.0", || {
            unreachable!()
        });
        assert!(err.is_err());
    }

    #[test]
    fn verify_sharing_demotes_single_user_shares() {
        let reg = TableRegistry::new();
        let t = reg
            .register_shared("solo", TableKind::ExactMatch, "count.0", || {
                Arc::new(KeyTable::new(64, 9, Some("solo".into())))
            })
            .unwrap();
        assert!(t.thread_safe());
        assert_eq!(reg.verify_sharing(), 1);
        assert_eq!(reg.shared_count(), 0);
        assert_eq!(reg.local_count(), 1);
        assert!(!t.thread_safe());
    }

    #[test]
    fn verify_sharing_keeps_real_shares() {
        let reg = TableRegistry::new();
        let t = reg
            .register_shared("pair", TableKind::ExactMatch, "count.0", || {
                Arc::new(KeyTable::new(64, 9, Some("pair".into())))
            })
            .unwrap();
        reg.register_shared::<KeyTable, _>("pair", TableKind::ExactMatch, "count.1", || {
            unreachable!()
        })
        .unwrap();
        assert_eq!(reg.verify_sharing(), 0);
        assert_eq!(reg.shared_count(), 1);
        assert!(t.thread_safe());
    }
}
