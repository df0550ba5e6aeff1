//! Core domain types and ports for the metrics agent runtime: the
//! measurement model, plugin capability traits, and the shared config/error
//! vocabulary every other crate in the workspace builds on.
//!
//! This crate depends on nothing runner-specific -- no buffering, filtering,
//! or scheduling policy lives here, only the shapes those components agree
//! on (spec §3, §6).

pub mod accumulator;
pub mod config;
pub mod error;
pub mod measurement;
pub mod ports;
pub mod secret;

pub use accumulator::{Accumulator, TrackingAccumulator, VecAccumulator, with_tracking};
pub use config::{
    AggregatorConfig, AggregatorConfigBuilder, CollectorRunnerConfig, CollectorRunnerConfigBuilder,
    ConfigError, FilterSpec, SinkRunnerConfig, SinkRunnerConfigBuilder,
};
pub use error::{ErrorKind, PluginError};
pub use measurement::{FieldValue, Measurement, MeasurementError, MeasurementKind, Timestamp};
pub use ports::{AggregatorPlugin, CollectorPlugin, Parser, Serializer, SinkPlugin};
pub use secret::{SecretRef, SecretRefError, SecretResolution};
