pub mod ast;
pub mod dtype;
pub mod label;
pub mod node;
pub mod types;

// Re-exported so downstream crates use one copy of each.
pub use ahash;
pub use log;
pub use parking_lot;
pub use serde;
pub use serde_json;
pub use thiserror;
