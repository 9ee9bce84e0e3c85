//! Operation queue
//!
//! Serializes asynchronous, state-mutating operations against one target:
//! - **push / unshift / queue:** admit an operation at the tail, head, or an index
//! - **abort:** permanently refuse to run anything not yet started
//! - **drop:** discard what is pending now, keep admitting new work

mod config;
mod core;
mod handle;
mod record;
mod state;

pub use config::{OpOptions, QueueConfig};
pub use handle::OperationQueue;
pub use record::{Callback, Next, Operation, Outcome, Settlement};
pub use state::{QueueState, QueueStats};
