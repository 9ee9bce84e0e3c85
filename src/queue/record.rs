//! Operation records and the completion protocol
//!
//! A record is settled exactly once. `Next` is the continuation handed to a
//! running operation; the first call delivers the outcome to the callback and
//! the settlement, then releases the dispatch gate. Later calls are ignored.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ErrorInput, ErrorKind, QueueError};
use crate::log::Logger;

/// A unit of work that accepts its completion continuation
///
/// Returning `Err` is treated exactly like calling `next.fail(err)`.
pub trait Operation<T>: Send + 'static {
    fn run(self: Box<Self>, next: Next<T>) -> eyre::Result<()>;
}

impl<T, F> Operation<T> for F
where
    F: FnOnce(Next<T>) -> eyre::Result<()> + Send + 'static,
{
    fn run(self: Box<Self>, next: Next<T>) -> eyre::Result<()> {
        (*self)(next)
    }
}

/// Payload handed to a per-enqueue callback
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Error-first form: the full result
    Settled(Result<T, QueueError>),
    /// Shift-error form: the value only, `None` on failure
    Shifted(Option<T>),
}

impl<T> Outcome<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Self::Settled(result) => result.ok(),
            Self::Shifted(value) => value,
        }
    }
}

/// Completion callback registered at enqueue time
pub type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// One-shot delivery of a result to the callback and the settlement
pub(crate) type Deliver<T> = Box<dyn FnOnce(Result<T, QueueError>) + Send + 'static>;

/// Identity of one dispatched run
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    pub(crate) run_id: u64,
    pub(crate) name: String,
    /// Resolved per-record debug flag
    pub(crate) debug: bool,
}

/// Scheduler side of the completion protocol
pub(crate) trait Gate: Send + Sync {
    /// Release the gate held by `ticket`; stale run ids are ignored
    fn release(self: Arc<Self>, ticket: &RunTicket, succeeded: bool);
}

/// Builds the delivery closure for a record
pub(crate) fn deliver<T>(
    tx: oneshot::Sender<Result<T, QueueError>>,
    callback: Option<Callback<T>>,
    shift_error: bool,
    logger: Logger,
) -> Deliver<T>
where
    T: Clone + Send + 'static,
{
    Box::new(move |result| {
        if let Some(callback) = callback {
            let outcome = if shift_error {
                Outcome::Shifted(result.as_ref().ok().cloned())
            } else {
                Outcome::Settled(result.clone())
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
                logger.error(&QueueError::normalize(ErrorKind::Callback, ErrorInput::from_panic(payload)));
            }
        }
        // The caller may have dropped its settlement; that is not an error
        let _ = tx.send(result);
    })
}

/// A queued operation waiting for dispatch
pub(crate) struct OperationRecord<T> {
    pub(crate) operation: Box<dyn Operation<T>>,
    pub(crate) name: String,
    pub(crate) priority: usize,
    pub(crate) drop_generation: u64,
    pub(crate) debug: bool,
    pub(crate) deliver: Deliver<T>,
}

impl<T> OperationRecord<T> {
    /// Settle without running the operation
    pub(crate) fn settle(self, result: Result<T, QueueError>) {
        (self.deliver)(result);
    }
}

struct NextInner<T> {
    ticket: RunTicket,
    deliver: Mutex<Option<Deliver<T>>>,
    gate: Arc<dyn Gate>,
}

impl<T> NextInner<T> {
    fn take(&self) -> Option<Deliver<T>> {
        self.deliver.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn finish(&self, result: Result<T, QueueError>) {
        let Some(deliver) = self.take() else {
            debug!(run_id = self.ticket.run_id, "Next::finish: already completed, ignoring");
            return;
        };
        let succeeded = result.is_ok();
        deliver(result);
        Arc::clone(&self.gate).release(&self.ticket, succeeded);
    }
}

impl<T> Drop for NextInner<T> {
    fn drop(&mut self) {
        let pending = self.deliver.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(deliver) = pending {
            debug!(run_id = self.ticket.run_id, "Next::drop: released without completion");
            deliver(Err(QueueError::new(
                ErrorKind::Operation,
                "operation finished without calling its completion handle",
            )));
            Arc::clone(&self.gate).release(&self.ticket, false);
        }
    }
}

/// Completion continuation passed to a running operation
///
/// Cloneable; only the first completion counts. If every clone is dropped
/// without completing, the record fails and the queue moves on.
pub struct Next<T> {
    inner: Arc<NextInner<T>>,
}

impl<T> Clone for Next<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Next<T> {
    pub(crate) fn new(ticket: RunTicket, deliver: Deliver<T>, gate: Arc<dyn Gate>) -> Self {
        Self {
            inner: Arc::new(NextInner {
                ticket,
                deliver: Mutex::new(Some(deliver)),
                gate,
            }),
        }
    }

    /// Complete with a result; an `Err` is normalized to an `OperationError`
    pub fn complete<E: Into<ErrorInput>>(&self, result: Result<T, E>) {
        self.inner
            .finish(result.map_err(|e| QueueError::normalize(ErrorKind::Operation, e)));
    }

    pub fn ok(&self, value: T) {
        self.inner.finish(Ok(value));
    }

    pub fn fail(&self, err: impl Into<ErrorInput>) {
        self.inner
            .finish(Err(QueueError::normalize(ErrorKind::Operation, err)));
    }

    /// Invocation counter value this run was started with
    pub fn run_id(&self) -> u64 {
        self.inner.ticket.run_id
    }
}

impl<T> std::fmt::Debug for Next<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("run_id", &self.inner.ticket.run_id)
            .field("name", &self.inner.ticket.name)
            .finish()
    }
}

/// Future resolving once with the record's result
#[must_use = "a settlement does nothing unless awaited; drop it to ignore the result"]
pub struct Settlement<T> {
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> Settlement<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, QueueError>>) -> Self {
        Self { rx }
    }
}

impl<T> Future for Settlement<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|received| received.unwrap_or_else(|_| Err(QueueError::closed())))
    }
}
