//! Logging sinks for queue tracing and error reports

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{ErrorInput, ErrorKind, QueueError};

/// Destination for debug traces (`log`) or error reports (`logerr`)
#[derive(Clone, Default)]
pub enum LogSink {
    /// Emit through `tracing` (`debug!` for traces, `error!` for errors)
    #[default]
    Tracing,

    /// Discard everything
    Disabled,

    /// Hand each prefixed line to a user function
    Custom(Arc<dyn Fn(&str) + Send + Sync>),
}

impl LogSink {
    pub fn custom(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(sink))
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracing => write!(f, "Tracing"),
            Self::Disabled => write!(f, "Disabled"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Namespaced writer over the two configured sinks
#[derive(Debug, Clone)]
pub(crate) struct Logger {
    namespace: Option<String>,
    prefix: String,
    log: LogSink,
    logerr: LogSink,
}

impl Logger {
    pub(crate) fn new(namespace: Option<String>, log: LogSink, logerr: LogSink) -> Self {
        let prefix = match &namespace {
            Some(ns) => format!("[opqueue:{ns}]"),
            None => "[opqueue]".to_string(),
        };
        Self {
            namespace,
            prefix,
            log,
            logerr,
        }
    }

    /// Emit a debug trace when `enabled`
    pub(crate) fn trace(&self, enabled: bool, message: impl fmt::Display) {
        if !enabled {
            return;
        }
        match &self.log {
            LogSink::Tracing => debug!(namespace = self.namespace(), "{message}"),
            LogSink::Disabled => {}
            LogSink::Custom(sink) => self.write_custom(sink, &format!("{} {message}", self.prefix)),
        }
    }

    /// Report an error to the error sink
    pub(crate) fn error(&self, err: &QueueError) {
        match &self.logerr {
            LogSink::Tracing => error!(namespace = self.namespace(), kind = %err.kind(), "{err}"),
            LogSink::Disabled => {}
            LogSink::Custom(sink) => self.write_custom(sink, &format!("{} {err}", self.prefix)),
        }
    }

    fn write_custom(&self, sink: &Arc<dyn Fn(&str) + Send + Sync>, line: &str) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(line))) {
            let err = QueueError::normalize(ErrorKind::Callback, ErrorInput::from_panic(payload));
            error!(namespace = self.namespace(), %err, "log sink panicked");
        }
    }

    fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture() -> (LogSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let sink = LogSink::custom(move |line| sink_lines.lock().unwrap().push(line.to_string()));
        (sink, lines)
    }

    #[test]
    fn test_trace_respects_enabled() {
        let (sink, lines) = capture();
        let logger = Logger::new(None, sink, LogSink::Disabled);

        logger.trace(false, "hidden");
        logger.trace(true, "shown");

        assert_eq!(*lines.lock().unwrap(), vec!["[opqueue] shown".to_string()]);
    }

    #[test]
    fn test_namespace_prefix() {
        let (sink, lines) = capture();
        let logger = Logger::new(Some("editor".to_string()), LogSink::Disabled, sink);

        logger.error(&QueueError::new(ErrorKind::Operation, "write failed"));

        assert_eq!(
            *lines.lock().unwrap(),
            vec!["[opqueue:editor] OperationError: write failed".to_string()]
        );
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let (sink, lines) = capture();
        let logger = Logger::new(None, LogSink::Disabled, LogSink::Disabled);
        logger.trace(true, "nothing");
        logger.error(&QueueError::new(ErrorKind::Callback, "nothing"));
        drop(sink);
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let logger = Logger::new(None, LogSink::custom(|_| panic!("sink exploded")), LogSink::Disabled);
        logger.trace(true, "still fine");
    }

    #[test]
    fn test_sink_debug_format() {
        assert_eq!(format!("{:?}", LogSink::Tracing), "Tracing");
        assert_eq!(format!("{:?}", LogSink::custom(|_| {})), "Custom(..)");
    }
}
