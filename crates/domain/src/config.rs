//! The contract the core consumes from the configuration collaborator --
//! not the textual file format (out of scope), just the typed shape each
//! runner needs. Builders follow the teacher's `ProducerConfig`-style
//! pattern: `::builder(required_field)` then chainable setters then a
//! fallible `.build()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Raw include/exclude/mutation rules for one filter chain, as the
/// configuration collaborator would hand them to us. Compiled into an
/// executable `filterchain::FilterChain` by the `filterchain` crate -- kept
/// here as plain data so `domain` need not depend on `filterchain`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Glob patterns for measurement name; empty = admit all names.
    pub name_include: Vec<String>,
    /// Glob patterns for measurement name to reject.
    pub name_exclude: Vec<String>,
    /// Glob patterns for tag keys to require at least one match of.
    pub tag_key_include: Vec<String>,
    /// Glob patterns for tag keys to reject.
    pub tag_key_exclude: Vec<String>,
    /// `key=value` glob pairs a measurement's tags must match at least one of.
    pub tag_pair_include: Vec<(String, String)>,
    /// `key=value` glob pairs that reject a measurement if any tag matches.
    pub tag_pair_exclude: Vec<(String, String)>,
    /// Glob patterns for field keys to require at least one match of.
    pub field_key_include: Vec<String>,
    /// Glob patterns for field keys to reject.
    pub field_key_exclude: Vec<String>,
    /// Tag keys to drop from a measurement that is admitted.
    pub drop_tags: Vec<String>,
    /// Field keys to drop from a measurement that is admitted.
    pub drop_fields: Vec<String>,
    /// Extra tag key/value pairs to attach to a measurement that is admitted.
    pub add_tags: Vec<(String, String)>,
}

/// Error raised when a config builder's invariants are violated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A numeric field was outside its required range.
    #[error("invalid configuration for {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Runtime configuration for a collector runner (§4.4).
#[derive(Debug, Clone)]
pub struct CollectorRunnerConfig {
    /// How often to tick.
    pub interval: Duration,
    /// Upper bound on random jitter added to the first tick.
    pub jitter: Duration,
    /// Precision the tick timestamp is rounded down to.
    pub precision: Duration,
    /// Per-collection timeout. Defaults to `interval` if unset at build time.
    pub timeout: Duration,
    /// Align the schedule to a wall-clock multiple of `interval`.
    pub round_interval: bool,
    /// Rules applied to every measurement this runner emits.
    pub filter: FilterSpec,
    /// Overrides the measurement name for every emission, if set.
    pub name_override: Option<String>,
    /// Tags attached to every emission from this runner.
    pub extra_tags: std::collections::BTreeMap<String, String>,
    /// Identifier distinguishing multiple instances of the same collector.
    pub alias: Option<String>,
}

/// Builder for [`CollectorRunnerConfig`].
#[derive(Debug, Clone)]
pub struct CollectorRunnerConfigBuilder {
    interval: Duration,
    jitter: Duration,
    precision: Duration,
    timeout: Option<Duration>,
    round_interval: bool,
    filter: FilterSpec,
    name_override: Option<String>,
    extra_tags: std::collections::BTreeMap<String, String>,
    alias: Option<String>,
}

impl CollectorRunnerConfig {
    /// Start a builder. `interval` is the only required parameter.
    #[must_use]
    pub fn builder(interval: Duration) -> CollectorRunnerConfigBuilder {
        CollectorRunnerConfigBuilder {
            interval,
            jitter: Duration::ZERO,
            precision: Duration::ZERO,
            timeout: None,
            round_interval: false,
            filter: FilterSpec::default(),
            name_override: None,
            extra_tags: std::collections::BTreeMap::new(),
            alias: None,
        }
    }
}

impl CollectorRunnerConfigBuilder {
    /// Set the startup jitter upper bound.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the timestamp rounding precision.
    #[must_use]
    pub fn precision(mut self, precision: Duration) -> Self {
        self.precision = precision;
        self
    }

    /// Override the per-collection timeout (default: `interval`).
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Align the schedule to a wall-clock multiple of `interval`.
    #[must_use]
    pub fn round_interval(mut self, round: bool) -> Self {
        self.round_interval = round;
        self
    }

    /// Set the filter chain rules.
    #[must_use]
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    /// Override the emitted measurement name.
    #[must_use]
    pub fn name_override(mut self, name: impl Into<String>) -> Self {
        self.name_override = Some(name.into());
        self
    }

    /// Attach a tag to every emission from this runner.
    #[must_use]
    pub fn extra_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_tags.insert(key.into(), value.into());
        self
    }

    /// Set the runner alias.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `interval` is zero.
    pub fn build(self) -> Result<CollectorRunnerConfig, ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "interval".to_owned(),
                reason: "must be > 0".to_owned(),
            });
        }
        Ok(CollectorRunnerConfig {
            interval: self.interval,
            jitter: self.jitter,
            precision: self.precision,
            timeout: self.timeout.unwrap_or(self.interval),
            round_interval: self.round_interval,
            filter: self.filter,
            name_override: self.name_override,
            extra_tags: self.extra_tags,
            alias: self.alias,
        })
    }
}

/// Runtime configuration for a sink runner (§4.5).
#[derive(Debug, Clone)]
pub struct SinkRunnerConfig {
    /// Time-based flush cadence.
    pub flush_interval: Duration,
    /// Upper bound on random jitter added to each flush tick.
    pub flush_jitter: Duration,
    /// Size-based flush trigger: flush once the buffer holds this many.
    pub metric_batch_size: usize,
    /// Running buffer capacity.
    pub buffer_capacity: usize,
    /// Rules applied to every measurement accepted by this sink.
    pub filter: FilterSpec,
    /// Per-flush timeout. Defaults to `flush_interval` if unset at build time.
    pub flush_timeout: Duration,
    /// Whether this sink requires an external readiness signal before its
    /// first flush (§4.5 Readiness gate). Buffering still proceeds either way.
    pub startup_gated: bool,
}

/// Builder for [`SinkRunnerConfig`].
#[derive(Debug, Clone)]
pub struct SinkRunnerConfigBuilder {
    flush_interval: Duration,
    flush_jitter: Duration,
    metric_batch_size: usize,
    buffer_capacity: usize,
    filter: FilterSpec,
    flush_timeout: Option<Duration>,
    startup_gated: bool,
}

impl SinkRunnerConfig {
    /// Start a builder. `flush_interval` and `buffer_capacity` are the only
    /// required parameters; `metric_batch_size` defaults to `buffer_capacity`.
    #[must_use]
    pub fn builder(flush_interval: Duration, buffer_capacity: usize) -> SinkRunnerConfigBuilder {
        SinkRunnerConfigBuilder {
            flush_interval,
            flush_jitter: Duration::ZERO,
            metric_batch_size: buffer_capacity,
            buffer_capacity,
            filter: FilterSpec::default(),
            flush_timeout: None,
            startup_gated: false,
        }
    }
}

impl SinkRunnerConfigBuilder {
    /// Set the flush jitter upper bound.
    #[must_use]
    pub fn flush_jitter(mut self, jitter: Duration) -> Self {
        self.flush_jitter = jitter;
        self
    }

    /// Override the size-based flush trigger.
    #[must_use]
    pub fn metric_batch_size(mut self, size: usize) -> Self {
        self.metric_batch_size = size;
        self
    }

    /// Set the filter chain rules.
    #[must_use]
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    /// Override the per-flush timeout (default: `flush_interval`).
    #[must_use]
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    /// Mark this sink as startup-gated.
    #[must_use]
    pub fn startup_gated(mut self, gated: bool) -> Self {
        self.startup_gated = gated;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `flush_interval` is zero or
    /// `buffer_capacity` is zero.
    pub fn build(self) -> Result<SinkRunnerConfig, ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "flush_interval".to_owned(),
                reason: "must be > 0".to_owned(),
            });
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_capacity".to_owned(),
                reason: "must be >= 1".to_owned(),
            });
        }
        Ok(SinkRunnerConfig {
            flush_interval: self.flush_interval,
            flush_jitter: self.flush_jitter,
            metric_batch_size: self.metric_batch_size.max(1),
            buffer_capacity: self.buffer_capacity,
            filter: self.filter,
            flush_timeout: self.flush_timeout.unwrap_or(self.flush_interval),
            startup_gated: self.startup_gated,
        })
    }
}

/// Runtime configuration for an aggregator (§4.3).
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Window length between ticks.
    pub period: Duration,
    /// Offset added to each tick boundary.
    pub delay: Duration,
    /// Whether matched originals are consumed (not forwarded) by this
    /// aggregator.
    pub drop_originals: bool,
    /// Rules selecting which measurements this aggregator consumes.
    pub filter: FilterSpec,
}

/// Builder for [`AggregatorConfig`].
#[derive(Debug, Clone)]
pub struct AggregatorConfigBuilder {
    period: Duration,
    delay: Duration,
    drop_originals: bool,
    filter: FilterSpec,
}

impl AggregatorConfig {
    /// Start a builder. `period` is the only required parameter.
    #[must_use]
    pub fn builder(period: Duration) -> AggregatorConfigBuilder {
        AggregatorConfigBuilder {
            period,
            delay: Duration::ZERO,
            drop_originals: false,
            filter: FilterSpec::default(),
        }
    }
}

impl AggregatorConfigBuilder {
    /// Set the tick boundary offset.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set whether matched originals are consumed by this aggregator.
    #[must_use]
    pub fn drop_originals(mut self, drop: bool) -> Self {
        self.drop_originals = drop;
        self
    }

    /// Set the filter chain rules.
    #[must_use]
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `period` is zero.
    pub fn build(self) -> Result<AggregatorConfig, ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::Invalid {
                field: "period".to_owned(),
                reason: "must be > 0".to_owned(),
            });
        }
        Ok(AggregatorConfig {
            period: self.period,
            delay: self.delay,
            drop_originals: self.drop_originals,
            filter: self.filter,
        })
    }
}
