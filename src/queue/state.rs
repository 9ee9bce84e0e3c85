//! Observability types for the queue

use serde::Serialize;

/// Counters accumulated over the queue's lifetime
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_invoked: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_aborted: u64,
    pub total_dropped: u64,
    /// Settled with `ClosedError` because the runtime was gone
    pub total_closed: u64,
    pub peak_depth: usize,
}

impl QueueStats {
    /// Records that reached a terminal state
    pub fn total_settled(&self) -> u64 {
        self.total_succeeded + self.total_failed + self.total_aborted + self.total_dropped + self.total_closed
    }
}

/// Point-in-time snapshot of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub busy: bool,
    pub pending: usize,
    pub invocations: u64,
    pub aborted: bool,
    pub drop_generation: u64,
    pub stats: QueueStats,
}

impl QueueState {
    /// Nothing running and nothing waiting
    pub fn is_idle(&self) -> bool {
        !self.busy && self.pending == 0
    }
}
