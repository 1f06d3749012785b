//! `count` tallies records per key. Built on the key-state adapter, so
//! it inherits share labels (`-J`), record caps (`-M`), and expiration
//! modes; counts are emitted as `(key, count)` records at expiration
//! and flush.

use crate::prockeystate::KeyStateKid;
use sluice_types::types::Record;

pub struct CountKid;

impl KeyStateKid for CountKid {
    fn name(&self) -> &'static str {
        "count"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["keycount"]
    }

    fn update(&self, state: &mut u64, _record: &Record) -> bool {
        *state += 1;
        false
    }

    fn emit_label(&self) -> Option<&'static str> {
        Some("COUNT")
    }
}
