//! Queue configuration and per-operation options

use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::log::LogSink;

/// Instance-level queue configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Callbacks receive only the value, never the error
    #[serde(rename = "shift-error")]
    pub shift_error: bool,

    /// Trace enqueue, dispatch and settlement events to the `log` sink
    pub debug: bool,

    /// Included in log prefixes and in the queue's textual identity
    pub namespace: Option<String>,

    /// Sink for debug traces
    #[serde(skip)]
    pub log: LogSink,

    /// Sink for operation and callback failures
    #[serde(skip)]
    pub logerr: LogSink,
}

impl QueueConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_shift_error(mut self, shift_error: bool) -> Self {
        self.shift_error = shift_error;
        self
    }

    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    pub fn with_logerr(mut self, logerr: LogSink) -> Self {
        self.logerr = logerr;
        self
    }

    /// Parse a YAML document; sinks keep their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        debug!("QueueConfig::from_yaml: called");
        serde_yaml::from_str(content).context("Failed to parse queue config")
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .context(format!("Failed to read queue config {}", path.as_ref().display()))?;
        let config = Self::from_yaml(&content)?;
        tracing::info!("Loaded queue config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Per-enqueue overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpOptions {
    /// Name used in traces instead of the operation's type name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "shift-error", skip_serializing_if = "Option::is_none")]
    pub shift_error: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl OpOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_shift_error(mut self, shift_error: bool) -> Self {
        self.shift_error = Some(shift_error);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// JSON rendering used in enqueue traces
    pub(crate) fn summary(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert!(!config.shift_error);
        assert!(!config.debug);
        assert!(config.namespace.is_none());
        assert!(matches!(config.log, LogSink::Tracing));
        assert!(matches!(config.logerr, LogSink::Tracing));
    }

    #[test]
    fn test_from_yaml() {
        let config = QueueConfig::from_yaml("shift-error: true\nnamespace: buffer\n").unwrap();
        assert!(config.shift_error);
        assert!(!config.debug);
        assert_eq!(config.namespace.as_deref(), Some("buffer"));
    }

    #[test]
    fn test_from_yaml_rejects_bad_types() {
        assert!(QueueConfig::from_yaml("debug: [1, 2]").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "debug: true").unwrap();

        let config = QueueConfig::load_from_file(file.path()).unwrap();
        assert!(config.debug);
    }

    #[test]
    fn test_load_missing_file() {
        let err = QueueConfig::load_from_file("/nonexistent/opqueue.yml").unwrap_err();
        assert!(err.to_string().contains("Failed to read queue config"));
    }

    #[test]
    fn test_options_summary_skips_unset() {
        assert_eq!(OpOptions::default().summary(), "{}");
        assert_eq!(
            OpOptions::named("save").with_shift_error(true).summary(),
            r#"{"name":"save","shift-error":true}"#
        );
    }
}
