//! Queue error types and failure normalization

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared, cloneable error cause
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Fixed kind tag carried by every [`QueueError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The operation reported a failure, returned `Err`, or panicked
    Operation,
    /// The record was dispatched after the queue was aborted
    Aborted,
    /// The record was queued before a drop and never ran
    Dropped,
    /// A user callback or log sink panicked (logged, never settled)
    Callback,
    /// The settlement sender went away before settling
    Closed,
}

impl ErrorKind {
    fn default_message(self) -> &'static str {
        match self {
            Self::Operation => "operation failed",
            Self::Aborted => "operation queue aborted",
            Self::Dropped => "operation dropped from queue",
            Self::Callback => "callback failed",
            Self::Closed => "operation queue closed before the operation settled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation => write!(f, "OperationError"),
            Self::Aborted => write!(f, "AbortedError"),
            Self::Dropped => write!(f, "DroppedError"),
            Self::Callback => write!(f, "CallbackError"),
            Self::Closed => write!(f, "ClosedError"),
        }
    }
}

/// Error surfaced by the queue through settlements, callbacks and the error sink
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct QueueError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
    trace: Option<Arc<str>>,
}

impl QueueError {
    /// Create an error of the given kind with no cause
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            trace: capture_trace(),
        }
    }

    /// Convert any raw failure value into a queue error of the given kind
    ///
    /// A `QueueError` that already has `kind` passes through untouched. One of a
    /// different kind becomes the cause and lends its message.
    pub fn normalize(kind: ErrorKind, input: impl Into<ErrorInput>) -> Self {
        let (message, cause) = match input.into() {
            ErrorInput::Queue(err) if err.kind == kind => return err,
            ErrorInput::Queue(err) => (err.message.clone(), Some(Arc::new(err) as Cause)),
            ErrorInput::Message(message) => (message, None),
            ErrorInput::Error(cause) => (cause.to_string(), Some(cause)),
            ErrorInput::Panic(message) => (message, None),
            ErrorInput::Unknown => (kind.default_message().to_string(), None),
        };

        Self {
            kind,
            message,
            cause,
            trace: capture_trace(),
        }
    }

    pub(crate) fn closed() -> Self {
        Self::normalize(ErrorKind::Closed, ErrorInput::Unknown)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message without the kind prefix
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Nested cause, if the failure wrapped another error
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Stack trace captured at normalization, when `RUST_BACKTRACE` enables capture
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    pub fn is_dropped(&self) -> bool {
        self.kind == ErrorKind::Dropped
    }
}

fn capture_trace() -> Option<Arc<str>> {
    let trace = Backtrace::capture();
    match trace.status() {
        BacktraceStatus::Captured => Some(Arc::from(trace.to_string())),
        _ => None,
    }
}

/// Raw failure value accepted by [`QueueError::normalize`], `abort`, `drop` and `Next::fail`
#[derive(Debug, Default)]
pub enum ErrorInput {
    Message(String),
    Error(Cause),
    Queue(QueueError),
    Panic(String),
    #[default]
    Unknown,
}

impl ErrorInput {
    /// Wrap any std error as the cause
    pub fn error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Error(Arc::new(err))
    }

    /// Extract a message from a `catch_unwind` payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<String>() {
            Ok(message) => Self::Panic(*message),
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => Self::Panic((*message).to_string()),
                Err(_) => Self::Unknown,
            },
        }
    }
}

impl From<&str> for ErrorInput {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<String> for ErrorInput {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<QueueError> for ErrorInput {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

impl From<eyre::Report> for ErrorInput {
    fn from(report: eyre::Report) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = report.into();
        Self::Error(Arc::from(boxed))
    }
}

impl From<Box<dyn std::error::Error + Send + Sync + 'static>> for ErrorInput {
    fn from(err: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self::Error(Arc::from(err))
    }
}

impl From<std::io::Error> for ErrorInput {
    fn from(err: std::io::Error) -> Self {
        Self::error(err)
    }
}

impl<T: Into<ErrorInput>> From<Option<T>> for ErrorInput {
    fn from(input: Option<T>) -> Self {
        input.map(Into::into).unwrap_or_default()
    }
}
