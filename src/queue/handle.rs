//! OperationQueue - public interface to the scheduler

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::ErrorInput;

use super::config::{OpOptions, QueueConfig};
use super::core::{Placement, QueueCore};
use super::record::{Callback, Next, Operation, Settlement};
use super::state::QueueState;

/// Serializes operations against one stateful target
///
/// This handle is cloneable; all clones share the same queue. Enqueue, abort
/// and drop never block and never run user code on the calling thread.
pub struct OperationQueue<T> {
    core: Arc<QueueCore<T>>,
}

impl<T> Clone for OperationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> OperationQueue<T>
where
    T: Clone + Send + 'static,
{
    /// Create a queue dispatching on the current tokio runtime
    pub fn new(config: QueueConfig) -> Result<Self> {
        let runtime = Handle::try_current().context("OperationQueue must be created inside a tokio runtime")?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a queue dispatching on the given runtime
    pub fn with_runtime(config: QueueConfig, runtime: Handle) -> Self {
        Self {
            core: Arc::new(QueueCore::new(config, runtime)),
        }
    }

    /// Enqueue at the tail
    pub fn push<F>(&self, operation: F) -> Settlement<T>
    where
        F: FnOnce(Next<T>) -> Result<()> + Send + 'static,
    {
        self.enqueue(operation, OpOptions::default(), None, Placement::Tail)
    }

    pub fn push_with<F>(&self, operation: F, options: OpOptions, callback: Option<Callback<T>>) -> Settlement<T>
    where
        F: FnOnce(Next<T>) -> Result<()> + Send + 'static,
    {
        self.enqueue(operation, options, callback, Placement::Tail)
    }

    /// Enqueue at the head, ahead of everything not yet dispatched
    pub fn unshift<F>(&self, operation: F) -> Settlement<T>
    where
        F: FnOnce(Next<T>) -> Result<()> + Send + 'static,
    {
        self.enqueue(operation, OpOptions::default(), None, Placement::Index(0))
    }

    pub fn unshift_with<F>(&self, operation: F, options: OpOptions, callback: Option<Callback<T>>) -> Settlement<T>
    where
        F: FnOnce(Next<T>) -> Result<()> + Send + 'static,
    {
        self.enqueue(operation, options, callback, Placement::Index(0))
    }

    /// Enqueue at `priority` (an insertion index clamped to the pending length), or the tail when `None`
    pub fn queue<F>(
        &self,
        operation: F,
        options: OpOptions,
        callback: Option<Callback<T>>,
        priority: Option<usize>,
    ) -> Settlement<T>
    where
        F: FnOnce(Next<T>) -> Result<()> + Send + 'static,
    {
        let placement = priority.map_or(Placement::Tail, Placement::Index);
        self.enqueue(operation, options, callback, placement)
    }

    /// Enqueue any [`Operation`] implementor at `priority`, or the tail when `None`
    ///
    /// Traces use the implementor's type name unless `options.name` is set.
    pub fn queue_operation<O>(
        &self,
        operation: O,
        options: OpOptions,
        callback: Option<Callback<T>>,
        priority: Option<usize>,
    ) -> Settlement<T>
    where
        O: Operation<T>,
    {
        let placement = priority.map_or(Placement::Tail, Placement::Index);
        self.enqueue(operation, options, callback, placement)
    }

    /// Enqueue an async closure at the tail
    ///
    /// The future is spawned on the queue's runtime when dispatched, and the
    /// next operation waits for it to finish.
    pub fn push_async<F, Fut>(&self, operation: F) -> Settlement<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let runtime = self.core.runtime().clone();
        let name = std::any::type_name::<F>();
        self.enqueue_named(
            move |next: Next<T>| -> Result<()> {
                runtime.spawn(async move {
                    next.complete(operation().await);
                });
                Ok(())
            },
            name,
            OpOptions::default(),
            None,
            Placement::Tail,
        )
    }

    /// Permanently stop running operations
    ///
    /// Every record dispatched from now on, whether already pending or pushed
    /// later, settles with an `AbortedError` wrapping `reason`. A running
    /// operation is left to finish.
    pub fn abort(&self, reason: impl Into<ErrorInput>) {
        debug!(queue = %self, "OperationQueue::abort: called");
        self.core.abort(reason.into());
    }

    /// Discard everything currently pending
    ///
    /// Records queued before this call settle with a `DroppedError` wrapping
    /// `reason` instead of running. Records queued afterwards are unaffected.
    pub fn drop(&self, reason: impl Into<ErrorInput>) {
        debug!(queue = %self, "OperationQueue::drop: called");
        self.core.drop_pending(reason.into());
    }

    pub fn is_aborted(&self) -> bool {
        self.core.is_aborted()
    }

    pub fn state(&self) -> QueueState {
        self.core.state()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.core.namespace()
    }

    fn enqueue<O>(
        &self,
        operation: O,
        options: OpOptions,
        callback: Option<Callback<T>>,
        placement: Placement,
    ) -> Settlement<T>
    where
        O: Operation<T>,
    {
        self.enqueue_named(operation, std::any::type_name::<O>(), options, callback, placement)
    }

    fn enqueue_named<O>(
        &self,
        operation: O,
        type_name: &'static str,
        options: OpOptions,
        callback: Option<Callback<T>>,
        placement: Placement,
    ) -> Settlement<T>
    where
        O: Operation<T>,
    {
        debug!(queue = %self, ?placement, "OperationQueue::enqueue: called");
        self.core
            .enqueue(Box::new(operation), type_name, options, callback, placement)
    }
}

impl<T> fmt::Display for OperationQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core.namespace() {
            Some(ns) => write!(f, "OperationQueue({ns})"),
            None => write!(f, "OperationQueue({})", self.core.id()),
        }
    }
}

impl<T> fmt::Debug for OperationQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("id", &self.core.id())
            .field("namespace", &self.core.namespace())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_runtime() {
        let err = OperationQueue::<u32>::new(QueueConfig::default()).unwrap_err();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn test_display_identity() {
        let named = OperationQueue::<u32>::new(QueueConfig::default().with_namespace("buffer")).unwrap();
        assert_eq!(named.to_string(), "OperationQueue(buffer)");
        assert_eq!(named.namespace(), Some("buffer"));

        let anonymous = OperationQueue::<u32>::new(QueueConfig::default()).unwrap();
        assert!(anonymous.to_string().starts_with("OperationQueue("));
        assert!(anonymous.namespace().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let queue = OperationQueue::<u32>::new(QueueConfig::default()).unwrap();
        let other = queue.clone();
        other.abort("closed");
        assert!(queue.is_aborted());
    }
}
