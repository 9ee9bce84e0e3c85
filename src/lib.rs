//! opqueue - Serializing operation queue
//!
//! An [`OperationQueue`] guarantees that at most one operation against a
//! stateful target runs at a time, and that each operation sees the target
//! exactly as the previous one left it.
//!
//! # Core Concepts
//!
//! - **Operations**: closures that receive a [`Next`] continuation and call it once when done
//! - **Settlements**: every enqueue returns a future that resolves exactly once
//! - **Abort**: terminal; nothing not yet started will ever run
//! - **Drop**: scoped; only what was pending at the time of the call is discarded
//!
//! # Modules
//!
//! - [`queue`] - Scheduler, records and the completion protocol
//! - [`error`] - Error kinds and failure normalization
//! - [`log`] - Logging sinks for traces and error reports

pub mod error;
pub mod log;
pub mod queue;

// Re-export commonly used types
pub use error::{ErrorInput, ErrorKind, QueueError};
pub use log::LogSink;
pub use queue::{
    Callback, Next, OpOptions, Operation, OperationQueue, Outcome, QueueConfig, QueueState, QueueStats, Settlement,
};
