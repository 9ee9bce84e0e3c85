//! Scheduler state and the dispatch gate

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorInput, ErrorKind, QueueError};
use crate::log::Logger;

use super::config::{OpOptions, QueueConfig};
use super::record::{Callback, Gate, Next, Operation, OperationRecord, RunTicket, Settlement, deliver};
use super::state::{QueueState, QueueStats};

/// Where a new record goes in `pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Tail,
    /// Insertion index, clamped to the pending length
    Index(usize),
}

/// Internal state protected by mutex
struct QueueInner<T> {
    pending: VecDeque<OperationRecord<T>>,

    /// True from the moment a drain is scheduled until the gate is released
    busy: bool,

    invocation_counter: u64,

    aborted: bool,
    abort_error: Option<QueueError>,

    drop_generation: u64,
    drop_error: Option<QueueError>,

    stats: QueueStats,
}

/// What dispatch does with a popped record
enum Verdict {
    Abort(QueueError),
    Drop(QueueError),
    Run,
}

/// Shared scheduler behind every `OperationQueue` handle
pub(crate) struct QueueCore<T> {
    id: Uuid,
    config: QueueConfig,
    logger: Logger,
    runtime: Handle,
    inner: Mutex<QueueInner<T>>,
}

impl<T> QueueCore<T> {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn namespace(&self) -> Option<&str> {
        self.config.namespace.as_deref()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle everything pending with `ClosedError` and free the gate
    ///
    /// Runs when a scheduled drain can never execute because its runtime is
    /// gone. Later enqueues on the same runtime end up here again.
    fn close_pending(&self) {
        let records: Vec<_> = {
            let mut inner = self.lock();
            inner.busy = false;
            let closed = inner.pending.len() as u64;
            inner.stats.total_closed += closed;
            inner.pending.drain(..).collect()
        };
        debug!(queue = %self.id, closed = records.len(), "QueueCore::close_pending: runtime unavailable");
        for record in records {
            self.logger
                .trace(record.debug, format_args!("close {}: runtime unavailable", record.name));
            record.settle(Err(QueueError::closed()));
        }
    }
}

/// A scheduled drain; closes the queue if dropped before it runs
struct DrainTask<T> {
    core: Option<Arc<QueueCore<T>>>,
}

impl<T> DrainTask<T>
where
    T: Clone + Send + 'static,
{
    fn run(mut self) {
        if let Some(core) = self.core.take() {
            core.drain();
        }
    }
}

impl<T> Drop for DrainTask<T> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.close_pending();
        }
    }
}

impl<T> QueueCore<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(config: QueueConfig, runtime: Handle) -> Self {
        let logger = Logger::new(config.namespace.clone(), config.log.clone(), config.logerr.clone());
        let id = Uuid::now_v7();
        debug!(%id, namespace = ?config.namespace, "QueueCore::new: called");
        Self {
            id,
            config,
            logger,
            runtime,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                busy: false,
                invocation_counter: 0,
                aborted: false,
                abort_error: None,
                drop_generation: 0,
                drop_error: None,
                stats: QueueStats::default(),
            }),
        }
    }

    /// Admit a record and request dispatch
    ///
    /// The drop generation is captured and the record inserted in the same
    /// critical section, so a concurrent `drop` either sees the record or not.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        operation: Box<dyn Operation<T>>,
        type_name: &'static str,
        options: OpOptions,
        callback: Option<Callback<T>>,
        placement: Placement,
    ) -> Settlement<T> {
        let (tx, rx) = oneshot::channel();
        let shift_error = options.shift_error.unwrap_or(self.config.shift_error);
        let debug = options.debug.unwrap_or(self.config.debug);
        let name = options.name.clone().unwrap_or_else(|| type_name.to_string());
        let deliver = deliver(tx, callback, shift_error, self.logger.clone());

        let (index, len, schedule) = {
            let mut inner = self.lock();
            let len = inner.pending.len();
            let index = match placement {
                Placement::Tail => len,
                Placement::Index(index) => index.min(len),
            };
            let record = OperationRecord {
                operation,
                name: name.clone(),
                priority: index,
                drop_generation: inner.drop_generation,
                debug,
                deliver,
            };
            inner.pending.insert(index, record);
            inner.stats.total_enqueued += 1;
            inner.stats.peak_depth = inner.stats.peak_depth.max(inner.pending.len());
            (index, len, Self::claim(&mut inner))
        };

        if debug {
            self.logger.trace(
                true,
                format_args!("enqueue {name} at {index}/{len} options={}", options.summary()),
            );
        }
        if schedule {
            self.schedule_drain();
        }
        Settlement::new(rx)
    }

    pub(crate) fn abort(&self, input: ErrorInput) {
        let err = QueueError::normalize(ErrorKind::Aborted, input);
        self.logger.trace(self.config.debug, format_args!("abort: {err}"));
        let mut inner = self.lock();
        inner.aborted = true;
        inner.abort_error = Some(err);
    }

    pub(crate) fn drop_pending(&self, input: ErrorInput) {
        let err = QueueError::normalize(ErrorKind::Dropped, input);
        let generation = {
            let mut inner = self.lock();
            inner.drop_generation += 1;
            inner.drop_error = Some(err.clone());
            inner.drop_generation
        };
        self.logger
            .trace(self.config.debug, format_args!("drop: generation {generation}: {err}"));
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub(crate) fn state(&self) -> QueueState {
        let inner = self.lock();
        QueueState {
            busy: inner.busy,
            pending: inner.pending.len(),
            invocations: inner.invocation_counter,
            aborted: inner.aborted,
            drop_generation: inner.drop_generation,
            stats: inner.stats.clone(),
        }
    }

    /// Take the gate if idle with work waiting; caller must schedule a drain on `true`
    fn claim(inner: &mut QueueInner<T>) -> bool {
        if inner.busy || inner.pending.is_empty() {
            return false;
        }
        inner.busy = true;
        true
    }

    /// Spawn a drain on the queue's runtime
    ///
    /// A runtime that has shut down drops the task unpolled, which closes the
    /// pending records instead of leaving the gate held forever.
    fn schedule_drain(self: &Arc<Self>) {
        let task = DrainTask {
            core: Some(Arc::clone(self)),
        };
        self.runtime.spawn(async move { task.run() });
    }

    /// Pop records until one actually runs or the queue is empty
    ///
    /// Aborted and dropped records are settled in this loop rather than by
    /// re-entering dispatch, so long runs of them never grow the stack.
    fn drain(self: &Arc<Self>) {
        loop {
            let (record, run_id, verdict) = {
                let mut inner = self.lock();
                let Some(record) = inner.pending.pop_front() else {
                    inner.busy = false;
                    return;
                };
                inner.invocation_counter += 1;
                let run_id = inner.invocation_counter;

                let verdict = if inner.aborted {
                    inner.stats.total_aborted += 1;
                    Verdict::Abort(
                        inner
                            .abort_error
                            .clone()
                            .unwrap_or_else(|| QueueError::normalize(ErrorKind::Aborted, ErrorInput::Unknown)),
                    )
                } else if inner.drop_generation != record.drop_generation {
                    inner.stats.total_dropped += 1;
                    Verdict::Drop(
                        inner
                            .drop_error
                            .clone()
                            .unwrap_or_else(|| QueueError::normalize(ErrorKind::Dropped, ErrorInput::Unknown)),
                    )
                } else {
                    inner.stats.total_invoked += 1;
                    Verdict::Run
                };
                (record, run_id, verdict)
            };

            match verdict {
                Verdict::Abort(err) | Verdict::Drop(err) => {
                    self.logger.trace(
                        record.debug,
                        format_args!("skip {} (run {run_id}): {err}", record.name),
                    );
                    record.settle(Err(err));
                }
                Verdict::Run => {
                    self.invoke(record, run_id);
                    return;
                }
            }
        }
    }

    /// Run one operation; the gate stays held until its `Next` completes
    fn invoke(self: &Arc<Self>, record: OperationRecord<T>, run_id: u64) {
        let OperationRecord {
            operation,
            name,
            priority,
            debug,
            deliver,
            ..
        } = record;
        self.logger
            .trace(debug, format_args!("run {name} (run {run_id}, enqueued at {priority})"));

        let ticket = RunTicket { run_id, name, debug };
        let next = Next::new(ticket, deliver, Arc::clone(self) as Arc<dyn Gate>);
        let guard = next.clone();
        let failure = match panic::catch_unwind(AssertUnwindSafe(move || operation.run(next))) {
            Ok(Ok(())) => None,
            Ok(Err(report)) => Some(ErrorInput::from(report)),
            Err(payload) => Some(ErrorInput::from_panic(payload)),
        };

        if let Some(input) = failure {
            let err = QueueError::normalize(ErrorKind::Operation, input);
            self.logger.error(&err);
            guard.complete(Err::<T, _>(err));
        }
    }
}

impl<T> Gate for QueueCore<T>
where
    T: Clone + Send + 'static,
{
    fn release(self: Arc<Self>, ticket: &RunTicket, succeeded: bool) {
        let run_id = ticket.run_id;
        let schedule = {
            let mut inner = self.lock();
            if succeeded {
                inner.stats.total_succeeded += 1;
            } else {
                inner.stats.total_failed += 1;
            }

            // A newer record owns the gate; a late completion must not free it
            if run_id != inner.invocation_counter {
                debug!(run_id, current = inner.invocation_counter, "QueueCore::release: stale run, ignoring");
                return;
            }
            inner.busy = false;
            Self::claim(&mut inner)
        };

        self.logger.trace(
            ticket.debug,
            format_args!("complete {} (run {run_id}, ok: {succeeded})", ticket.name),
        );
        if schedule {
            self.schedule_drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core() -> Arc<QueueCore<u32>> {
        Arc::new(QueueCore::new(QueueConfig::default(), Handle::current()))
    }

    fn ticket(run_id: u64) -> RunTicket {
        RunTicket {
            run_id,
            name: "noop".to_string(),
            debug: false,
        }
    }

    fn enqueue_noop(core: &Arc<QueueCore<u32>>, placement: Placement) -> Settlement<u32> {
        core.enqueue(
            Box::new(|next: Next<u32>| -> eyre::Result<()> {
                next.ok(0);
                Ok(())
            }),
            "noop",
            OpOptions::default(),
            None,
            placement,
        )
    }

    #[tokio::test]
    async fn test_enqueue_does_not_run_synchronously() {
        let core = core();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let settlement = core.enqueue(
            Box::new(move |next: Next<u32>| -> eyre::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                next.ok(1);
                Ok(())
            }),
            "count",
            OpOptions::default(),
            None,
            Placement::Tail,
        );

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let state = core.state();
        assert!(state.busy);
        assert_eq!(state.pending, 1);

        assert_eq!(settlement.await.unwrap(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_gate() {
        let core = core();
        let first = enqueue_noop(&core, Placement::Tail);
        first.await.unwrap();

        // Simulate a record currently holding the gate as run 2
        {
            let mut inner = core.lock();
            inner.busy = true;
            inner.invocation_counter = 2;
        }
        let _second = enqueue_noop(&core, Placement::Tail);

        Arc::clone(&core).release(&ticket(1), true);
        let state = core.state();
        assert!(state.busy);
        assert_eq!(state.pending, 1);

        Arc::clone(&core).release(&ticket(2), true);
        tokio::task::yield_now().await;
        let state = core.state();
        assert_eq!(state.pending, 0);
    }

    #[tokio::test]
    async fn test_index_placement_is_clamped() {
        let core = core();
        {
            core.lock().busy = true;
        }
        let _a = enqueue_noop(&core, Placement::Tail);
        let _b = enqueue_noop(&core, Placement::Index(99));
        let _c = enqueue_noop(&core, Placement::Index(1));

        let inner = core.lock();
        let priorities: Vec<_> = inner.pending.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn test_drop_generation_captured_at_enqueue() {
        let core = core();
        {
            core.lock().busy = true;
        }
        let _a = enqueue_noop(&core, Placement::Tail);
        core.drop_pending(ErrorInput::from("reset"));
        let _b = enqueue_noop(&core, Placement::Index(0));

        let inner = core.lock();
        let generations: Vec<_> = inner.pending.iter().map(|r| r.drop_generation).collect();
        assert_eq!(generations, vec![1, 0]);
        assert_eq!(inner.drop_generation, 1);
    }

    #[tokio::test]
    async fn test_unrun_drain_closes_pending() {
        let core = core();
        {
            core.lock().busy = true;
        }
        let first = enqueue_noop(&core, Placement::Tail);
        let second = enqueue_noop(&core, Placement::Tail);

        drop(DrainTask {
            core: Some(Arc::clone(&core)),
        });

        for settlement in [first, second] {
            assert_eq!(settlement.await.unwrap_err().kind(), ErrorKind::Closed);
        }
        let state = core.state();
        assert!(state.is_idle());
        assert_eq!(state.stats.total_closed, 2);
        assert_eq!(state.invocations, 0);
    }
}
