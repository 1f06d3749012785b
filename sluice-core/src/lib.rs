pub mod compiler;
pub mod env;
pub mod errors;
pub mod graph;
pub mod module;
pub mod modules;
pub mod procbuffer;
pub mod prockeystate;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod tables;

#[cfg(test)]
mod tests;

pub use runtime::{RunReport, Runtime, RuntimeOptions};
pub use scheduler::{exit_flag, request_exit};

/// Default capacity of a cross-thread queue.
pub const DEFAULT_SHARED_QUEUE_LEN: usize = 16;

/// How many times a bounded cross-thread push retries before giving up.
pub const SHARED_QUEUE_RETRY_LIMIT: usize = 1000;

/// External jobs serviced per drain pass, so one flooded queue cannot
/// starve local work.
pub const MAX_EXT_JOBS: usize = 4;

/// Local jobs serviced per scheduler pass.
pub const MAX_LOCAL_JOBS: usize = 256;
