//! External interfaces (§6): the hexagonal ports every plugin implements and
//! the core consumes. Concrete collectors/sinks/aggregators/parsers are
//! deliberately out of scope -- only the contracts live here.

use std::sync::Arc;

use async_trait::async_trait;

use crate::accumulator::Accumulator;
use crate::error::PluginError;
use crate::measurement::Measurement;

/// A plugin that originates measurements.
///
/// Boxed as `Box<dyn CollectorPlugin>` by the agent's plugin registry, since
/// the set of concrete collectors loaded at runtime is heterogeneous --
/// unlike the teacher's single-adapter-per-port generics, the agent must
/// hold many different collector types side by side.
#[async_trait]
pub trait CollectorPlugin: Send + Sync {
    /// A sample configuration snippet for this collector (documentation
    /// only; the core never parses it).
    fn sample_config(&self) -> &'static str;

    /// Optional one-time initialization. Default: no-op.
    ///
    /// # Errors
    ///
    /// Returning `Err` here aborts only this runner (`PluginInitFailed`).
    async fn init(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Synchronous-from-the-runner's-perspective collection: returns once
    /// this tick's collection is complete. Bounded by the runner's `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] on any collection failure (`CollectError`).
    async fn gather(&self, acc: &dyn Accumulator) -> Result<(), PluginError>;

    /// Optional push-style start for collectors whose emissions are
    /// asynchronous (e.g. consuming a message queue). Default: no-op.
    async fn start(&mut self, _acc: Arc<dyn Accumulator>) -> Result<(), PluginError> {
        Ok(())
    }

    /// Stop a push-style collector started via [`CollectorPlugin::start`].
    async fn stop(&mut self) {}
}

/// A plugin that delivers measurements to an external system.
#[async_trait]
pub trait SinkPlugin: Send + Sync {
    /// A sample configuration snippet for this sink (documentation only).
    fn sample_config(&self) -> &'static str;

    /// Establish (or re-establish) the connection to the external system.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] (`ConnectFailed`) on failure; the sink runner
    /// retries with backoff.
    async fn connect(&mut self) -> Result<(), PluginError>;

    /// Write a batch. Atomic with respect to the caller: either all
    /// measurements are accepted, or none are (the whole batch is rejected).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] (`WriteFailed`); mark
    /// [`PluginError::connection_lost`] if the failure means the connection
    /// itself needs to be re-established.
    async fn write(&mut self, batch: &[Measurement]) -> Result<(), PluginError>;

    /// Release any resources held by [`SinkPlugin::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the close itself fails; the sink runner
    /// logs but does not treat this as fatal.
    async fn close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Whether this sink is "startup-gated": connected but not flushed to
    /// until an external readiness signal arrives (§4.5 Readiness gate).
    /// Default: always ready.
    fn startup_gated(&self) -> bool {
        false
    }

    /// Apply freshly re-resolved configuration text before the next
    /// [`SinkPlugin::connect`] attempt -- the call site a dynamic secret's
    /// current value reaches the plugin through (§4.8: a dynamic secret is
    /// re-looked-up on each call, and reconnect is the call a sink plugin
    /// makes repeatedly over its lifetime). Default: no-op, for plugins
    /// whose configuration has nothing dynamic in it.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the plugin rejects the new configuration;
    /// the sink runner treats this like a connect failure and retries.
    async fn reconfigure(&mut self, _config: &str) -> Result<(), PluginError> {
        Ok(())
    }
}

/// A plugin that computes windowed derived measurements.
#[async_trait]
pub trait AggregatorPlugin: Send + Sync {
    /// Fold `m` into state keyed by `m.hash_identity()`.
    fn add(&mut self, m: &Measurement);

    /// Emit zero or more derived measurements into `acc`.
    async fn push(&mut self, acc: &dyn Accumulator);

    /// Clear state for the next window.
    fn reset(&mut self);
}

/// Consumed-only: turns wire bytes into measurements. No implementation
/// ships in this core; concrete parsers are an external collaborator.
pub trait Parser {
    /// Parse error type; left abstract since concrete wire formats are out
    /// of scope here.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Parse a byte buffer into zero or more measurements.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` on malformed input.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<Measurement>, Self::Error>;
}

/// Consumed-only: turns a batch of measurements into wire bytes.
pub trait Serializer {
    /// Serialization error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Serialize `batch` to bytes.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` if any measurement cannot be represented.
    fn serialize(&self, batch: &[Measurement]) -> Result<Vec<u8>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::VecAccumulator;
    use crate::measurement::{FieldValue, MeasurementKind};
    use std::collections::BTreeMap;

    struct EchoCollector;

    #[async_trait]
    impl CollectorPlugin for EchoCollector {
        fn sample_config(&self) -> &'static str {
            "# echo collector, no config"
        }

        async fn gather(&self, acc: &dyn Accumulator) -> Result<(), PluginError> {
            let mut fields = BTreeMap::new();
            fields.insert("value".to_owned(), FieldValue::Int64(42));
            acc.add_gauge("echo", fields, BTreeMap::new(), None);
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_collector_methods_are_noops() {
        let mut collector = EchoCollector;
        assert!(collector.init().await.is_ok());
        let acc = std::sync::Arc::new(VecAccumulator::new());
        assert!(collector.start(acc).await.is_ok());
        collector.stop().await;
    }

    #[tokio::test]
    async fn gather_forwards_into_accumulator() {
        let collector = EchoCollector;
        let acc = VecAccumulator::new();
        collector.gather(&acc).await.unwrap();
        let collected = acc.take_measurements();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].name(), "echo");
        assert_eq!(collected[0].kind(), MeasurementKind::Gauge);
    }
}
