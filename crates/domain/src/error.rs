//! Shared error types used across plugin boundaries.
//!
//! Per-component error enums (`CollectTimeout`, `WriteFailed`, ...) live in
//! their owning crates; this module only holds the few types that must be
//! shared because they cross a trait boundary every plugin implements.

use std::error::Error as StdError;
use std::fmt;

/// Error returned by a collector, sink, or aggregator plugin.
///
/// Every plugin invocation is isolated: a panic inside a plugin is caught by
/// its runner and converted to a [`PluginError`] rather than unwinding into
/// the agent (see spec §7 "Recovery boundaries").
#[derive(Debug)]
pub struct PluginError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    /// Set by a sink when a `write` failure indicates the connection itself
    /// was lost, so the sink runner knows to `close()` then `connect()`
    /// before the next attempt (§4.5 "Connect lifecycle").
    connection_lost: bool,
}

impl PluginError {
    /// Build a plain plugin error with no wrapped cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            connection_lost: false,
        }
    }

    /// Wrap an underlying error as the cause.
    #[must_use]
    pub fn from_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
            connection_lost: false,
        }
    }

    /// Mark this error as indicating the sink's connection was lost.
    #[must_use]
    pub fn connection_lost(mut self) -> Self {
        self.connection_lost = true;
        self
    }

    /// Whether this error indicates the sink's connection was lost.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for PluginError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|b| b.as_ref() as &(dyn StdError + 'static))
    }
}

/// The error-kind taxonomy from spec §7, used by the self-monitoring
/// collector to label counters without each crate re-declaring the same
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// Configuration rejected at load time. Fatal.
    ConfigInvalid,
    /// A runner's plugin failed to initialize. That runner alone aborts.
    PluginInitFailed,
    /// A collector's `gather` exceeded its timeout.
    CollectTimeout,
    /// A collector's `gather` returned an error.
    CollectError,
    /// A measurement was rejected by a filter chain.
    FilterDrop,
    /// The running buffer dropped the oldest entry on overflow.
    BufferOverflow,
    /// The fan-out channel was full; dropped at the producer.
    IngressDrop,
    /// A sink failed to connect.
    ConnectFailed,
    /// A sink's `write` failed.
    WriteFailed,
    /// A sink's `write` exceeded its flush timeout.
    FlushTimeout,
    /// The shutdown deadline elapsed with buffered data remaining.
    ShutdownDeadline,
    /// The secret gateway failed to resolve a reference.
    SecretResolveError,
}

impl ErrorKind {
    /// All variants, in table order, for iterating counters.
    #[must_use]
    pub const fn all() -> &'static [ErrorKind] {
        &[
            ErrorKind::ConfigInvalid,
            ErrorKind::PluginInitFailed,
            ErrorKind::CollectTimeout,
            ErrorKind::CollectError,
            ErrorKind::FilterDrop,
            ErrorKind::BufferOverflow,
            ErrorKind::IngressDrop,
            ErrorKind::ConnectFailed,
            ErrorKind::WriteFailed,
            ErrorKind::FlushTimeout,
            ErrorKind::ShutdownDeadline,
            ErrorKind::SecretResolveError,
        ]
    }

    /// Lowercase snake_case label, used as a field key on "self" measurements.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::PluginInitFailed => "plugin_init_failed",
            ErrorKind::CollectTimeout => "collect_timeout",
            ErrorKind::CollectError => "collect_error",
            ErrorKind::FilterDrop => "filter_drop",
            ErrorKind::BufferOverflow => "buffer_overflow",
            ErrorKind::IngressDrop => "ingress_drop",
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::WriteFailed => "write_failed",
            ErrorKind::FlushTimeout => "flush_timeout",
            ErrorKind::ShutdownDeadline => "shutdown_deadline",
            ErrorKind::SecretResolveError => "secret_resolve_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_error_display_uses_message() {
        let err = PluginError::new("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn connection_lost_flag_round_trips() {
        let err = PluginError::new("lost").connection_lost();
        assert!(err.is_connection_lost());
        let err = PluginError::new("fine");
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn error_kind_labels_are_unique() {
        let labels: Vec<&str> = ErrorKind::all().iter().map(|k| k.label()).collect();
        let mut sorted = labels.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(labels.len(), sorted.len());
    }
}
