//! Modules shipped in-tree. `bundle` and `unbundle` are required by the
//! compiler's bundle rewriting; the rest are small general-purpose
//! nodes that double as adapter exercises.

mod append;
mod bundle;
mod count;
mod seq;
mod tag;

pub use append::AppendKid;
pub use bundle::{Bundle, Unbundle};
pub use count::CountKid;
pub use seq::Seq;
pub use tag::Tag;

use crate::module::Module;
use crate::procbuffer::BufferModule;
use crate::prockeystate::KeyStateModule;
use std::sync::Arc;

pub fn builtin_modules() -> Vec<Arc<dyn Module>> {
    vec![
        Arc::new(Bundle),
        Arc::new(Unbundle),
        Arc::new(Tag),
        Arc::new(Seq),
        Arc::new(KeyStateModule::new(CountKid)),
        Arc::new(BufferModule::new(AppendKid)),
    ]
}
