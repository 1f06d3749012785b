//! Exact-match keyed state table: sharded rows, seeded hashing, FIFO
//! expiration under a record cap, and an optional on-disk image.

use super::{StateTable, TableKind};
use crate::errors::TableError;
use sluice_types::ahash::RandomState;
use sluice_types::log::warn;
use sluice_types::parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash, Hasher};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// 13-byte identifier tag opening every serialized table image.
pub const KEYTABLE_TAG: &[u8; 13] = b"SLUICEKEYTB1 ";

const ROW_SHIFT: u32 = 6;

/// Ideal row-count exponent for a table expected to hold `records`
/// entries, leaving headroom of 20x before chains build up.
pub fn ideal_log2(records: u64) -> u32 {
    let target = records.saturating_mul(20).max(2);
    64 - (target - 1).leading_zeros() + 1
}

#[derive(Default)]
struct Row {
    map: HashMap<Vec<u8>, u64>,
    order: VecDeque<Vec<u8>>,
}

/// Hash-backed exact-match table. Rows are individually locked; the
/// post-compile sharing verification clears `thread_safe` when only one
/// node ended up using the table.
pub struct KeyTable {
    rows: Box<[Mutex<Row>]>,
    hasher: RandomState,
    seed: u32,
    max_records: usize,
    thread_safe: AtomicBool,
    expired: AtomicU64,
    label: Option<String>,
}

impl KeyTable {
    pub fn new(max_records: usize, seed: u32, label: Option<String>) -> Self {
        let log2 = ideal_log2(max_records as u64).min(20).max(ROW_SHIFT);
        Self::with_log2(log2, max_records, seed, label)
    }

    fn with_log2(log2: u32, max_records: usize, seed: u32, label: Option<String>) -> Self {
        let nrows = 1usize << (log2.saturating_sub(ROW_SHIFT)).max(1);
        let rows = (0..nrows)
            .map(|_| Mutex::new(Row::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            rows,
            hasher: RandomState::with_seeds(
                seed as u64,
                (seed as u64).rotate_left(17) ^ 0x9e37_79b9,
                (seed as u64).rotate_left(31) ^ 0x85eb_ca6b,
                (seed as u64).rotate_left(47) ^ 0xc2b2_ae35,
            ),
            seed,
            max_records: max_records.max(1),
            thread_safe: AtomicBool::new(true),
            expired: AtomicU64::new(0),
            label,
        }
    }

    fn row_of(&self, key: &[u8]) -> &Mutex<Row> {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        let idx = (h.finish() as usize) & (self.rows.len() - 1);
        &self.rows[idx]
    }

    fn row_cap(&self) -> usize {
        (self.max_records / self.rows.len()).max(1)
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn check(&self, key: &[u8]) -> bool {
        self.row_of(key).lock().map.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.row_of(key).lock().map.get(key).copied()
    }

    /// Applies `f` to the state under `key`, inserting a zero state
    /// first if the key is new. When the insertion pushes the row over
    /// its share of the record cap, the oldest entry in the row is
    /// expired and returned so the caller can emit it.
    pub fn update<F: FnOnce(&mut u64)>(&self, key: &[u8], f: F) -> Option<(Vec<u8>, u64)> {
        let row = self.row_of(key);
        let mut guard = row.lock();
        let mut evicted = None;
        if !guard.map.contains_key(key) {
            if guard.map.len() >= self.row_cap() {
                while let Some(old) = guard.order.pop_front() {
                    if let Some(state) = guard.map.remove(&old) {
                        self.expired.fetch_add(1, Ordering::Relaxed);
                        evicted = Some((old, state));
                        break;
                    }
                }
            }
            guard.map.insert(key.to_vec(), 0);
            guard.order.push_back(key.to_vec());
        }
        if let Some(state) = guard.map.get_mut(key) {
            f(state);
        }
        evicted
    }

    pub fn insert(&self, key: &[u8], value: u64) -> Option<(Vec<u8>, u64)> {
        self.update(key, |state| *state = value)
    }

    pub fn remove(&self, key: &[u8]) -> Option<u64> {
        let mut guard = self.row_of(key).lock();
        let out = guard.map.remove(key);
        if out.is_some() {
            guard.order.retain(|k| k != key);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rows.iter().map(|r| r.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, invoking `f` on each. Batch expiration and
    /// exit-flush emission both land here.
    pub fn drain_all<F: FnMut(&[u8], u64)>(&self, mut f: F) {
        for row in self.rows.iter() {
            let mut guard = row.lock();
            let order = std::mem::take(&mut guard.order);
            for key in order {
                if let Some(state) = guard.map.remove(&key) {
                    f(&key, state);
                }
            }
            guard.map.clear();
        }
    }

    /// Serializes the table: tag, log2 row count (auto-reduced toward
    /// the ideal size for the current population), hash seed, entry
    /// count, then the raw entries.
    pub fn dump<W: Write>(&self, w: &mut W) -> Result<(), TableError> {
        let entries: Vec<(Vec<u8>, u64)> = {
            let mut out = Vec::new();
            for row in self.rows.iter() {
                let guard = row.lock();
                for key in &guard.order {
                    if let Some(v) = guard.map.get(key) {
                        out.push((key.clone(), *v));
                    }
                }
            }
            out
        };
        let current_log2 = self.rows.len().trailing_zeros() + ROW_SHIFT;
        let log2 = current_log2.min(ideal_log2(entries.len() as u64));
        w.write_all(KEYTABLE_TAG)?;
        w.write_all(&log2.to_le_bytes())?;
        w.write_all(&self.seed.to_le_bytes())?;
        w.write_all(&(entries.len() as u64).to_le_bytes())?;
        for (key, value) in entries {
            w.write_all(&(key.len() as u32).to_le_bytes())?;
            w.write_all(&key)?;
            w.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a table image back. A truncated or mistagged image is an
    /// error; callers that tolerate partial state log it and start
    /// empty.
    pub fn load<R: Read>(r: &mut R, max_records: usize) -> Result<Self, TableError> {
        let mut tag = [0u8; 13];
        r.read_exact(&mut tag).map_err(|_| TableError::ShortImage)?;
        if &tag != KEYTABLE_TAG {
            return Err(TableError::BadImage(format!(
                "unrecognized tag {:?}",
                String::from_utf8_lossy(&tag)
            )));
        }
        let mut word = [0u8; 4];
        r.read_exact(&mut word).map_err(|_| TableError::ShortImage)?;
        let log2 = u32::from_le_bytes(word);
        if log2 > 32 {
            return Err(TableError::BadImage(format!("log2 size {log2} out of range")));
        }
        r.read_exact(&mut word).map_err(|_| TableError::ShortImage)?;
        let seed = u32::from_le_bytes(word);
        let mut count_word = [0u8; 8];
        r.read_exact(&mut count_word)
            .map_err(|_| TableError::ShortImage)?;
        let count = u64::from_le_bytes(count_word);
        let table = Self::with_log2(log2.max(ROW_SHIFT), max_records, seed, None);
        for _ in 0..count {
            r.read_exact(&mut word).map_err(|_| TableError::ShortImage)?;
            let klen = u32::from_le_bytes(word) as usize;
            let mut key = vec![0u8; klen];
            r.read_exact(&mut key).map_err(|_| TableError::ShortImage)?;
            r.read_exact(&mut count_word)
                .map_err(|_| TableError::ShortImage)?;
            table.insert(&key, u64::from_le_bytes(count_word));
        }
        Ok(table)
    }

    /// Load that tolerates a damaged image by starting empty, unless
    /// `readonly` demands the image be intact.
    pub fn load_or_empty<R: Read>(
        r: &mut R,
        max_records: usize,
        seed: u32,
        readonly: bool,
    ) -> Result<Self, TableError> {
        match Self::load(r, max_records) {
            Ok(t) => Ok(t),
            Err(e) if !readonly => {
                warn!("state table image unusable ({e}); starting empty");
                Ok(Self::new(max_records, seed, None))
            }
            Err(e) => Err(e),
        }
    }
}

impl StateTable for KeyTable {
    fn kind(&self) -> TableKind {
        TableKind::ExactMatch
    }

    fn mem_used(&self) -> u64 {
        self.rows
            .iter()
            .map(|r| {
                let guard = r.lock();
                guard
                    .map
                    .iter()
                    .map(|(k, _)| (k.len() + 8) as u64)
                    .sum::<u64>()
            })
            .sum()
    }

    fn hash_seed(&self) -> u32 {
        self.seed
    }

    fn expire_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    fn thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Acquire)
    }

    fn set_thread_safe(&self, on: bool) {
        self.thread_safe.store(on, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_counts_and_checks() {
        let t = KeyTable::new(1024, 7, None);
        assert!(!t.check(b"a"));
        t.update(b"a", |s| *s += 1);
        t.update(b"a", |s| *s += 1);
        t.update(b"b", |s| *s += 1);
        assert_eq!(t.get(b"a"), Some(2));
        assert_eq!(t.get(b"b"), Some(1));
        assert!(t.check(b"a"));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn expiration_evicts_oldest_in_row() {
        // One row so eviction order is observable.
        let t = KeyTable::with_log2(ROW_SHIFT, 2, 0, None);
        assert_eq!(t.rows.len(), 2);
        // Force both keys into row coverage regardless of hashing by
        // filling well past the cap.
        let mut evicted = 0;
        for i in 0..100u64 {
            if t.insert(&i.to_le_bytes(), i).is_some() {
                evicted += 1;
            }
        }
        assert!(evicted > 0);
        assert_eq!(t.expire_count(), evicted);
        assert!(t.len() <= 2 * t.row_cap());
    }

    #[test]
    fn dump_reload_agrees_on_every_probed_key() {
        let t = KeyTable::new(4096, 42, None);
        for i in 0..200u64 {
            t.insert(format!("key-{i}").as_bytes(), i * 3);
        }
        let mut image = Vec::new();
        t.dump(&mut image).unwrap();
        assert_eq!(&image[..13], KEYTABLE_TAG);
        let back = KeyTable::load(&mut image.as_slice(), 4096).unwrap();
        assert_eq!(back.hash_seed(), 42);
        for i in 0..400u64 {
            let key = format!("key-{i}");
            assert_eq!(back.check(key.as_bytes()), t.check(key.as_bytes()));
            assert_eq!(back.get(key.as_bytes()), t.get(key.as_bytes()));
        }
    }

    #[test]
    fn damaged_image_starts_empty_unless_readonly() {
        let garbage = b"not a table image at all";
        let t = KeyTable::load_or_empty(&mut &garbage[..], 128, 5, false).unwrap();
        assert!(t.is_empty());
        assert!(KeyTable::load_or_empty(&mut &garbage[..], 128, 5, true).is_err());
    }

    #[test]
    fn ideal_bits_formula() {
        // ceil(log2(20 * records)) + 1
        assert_eq!(ideal_log2(1), 6); // 20 -> ceil=5, +1
        assert_eq!(ideal_log2(100), 12); // 2000 -> ceil=11, +1
    }
}
