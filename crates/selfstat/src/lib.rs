//! Built-in "self" collector (§5 "the agent exposes both counters through a
//! built-in self collector", §7): turns the drop/error/retry counters other
//! runners accumulate into ordinary measurements, so they flow through the
//! same filter/buffer/sink machinery as everything else. Grounded in the
//! teacher's `logger` crate only for its counter-reporting spirit -- the
//! teacher has no self-monitoring collector of its own, since its pipeline
//! has a fixed three-stage shape with no plugin registry to introspect.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use domain::{Accumulator, CollectorPlugin, FieldValue, PluginError};

/// One registered collector runner's counters, labelled by alias.
struct CollectorSource {
    alias: String,
    stats: Arc<collector_runner::CollectorStats>,
}

/// One registered sink runner's counters and buffer, labelled by alias.
struct SinkSource {
    alias: String,
    runner: Arc<sink_runner::SinkRunner>,
}

/// Reports every registered runner's counters as one measurement per runner
/// per tick. Registration happens once, while wiring the agent together,
/// before this collector is boxed and handed to its own runner.
#[derive(Default)]
pub struct SelfStatCollector {
    collectors: Vec<CollectorSource>,
    sinks: Vec<SinkSource>,
}

impl std::fmt::Debug for SelfStatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfStatCollector")
            .field("collectors", &self.collectors.len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl SelfStatCollector {
    /// An empty self collector with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector runner's counters under `alias`.
    pub fn register_collector(&mut self, alias: impl Into<String>, stats: Arc<collector_runner::CollectorStats>) {
        self.collectors.push(CollectorSource { alias: alias.into(), stats });
    }

    /// Register a sink runner under `alias`, reporting both its plugin
    /// counters and its running buffer's quiescent-invariant counters.
    pub fn register_sink(&mut self, alias: impl Into<String>, runner: Arc<sink_runner::SinkRunner>) {
        self.sinks.push(SinkSource { alias: alias.into(), runner });
    }
}

#[async_trait]
impl CollectorPlugin for SelfStatCollector {
    fn sample_config(&self) -> &'static str {
        "# built-in self-monitoring collector, no configuration"
    }

    async fn gather(&self, acc: &dyn Accumulator) -> Result<(), PluginError> {
        tracing::trace!(
            collectors = self.collectors.len(),
            sinks = self.sinks.len(),
            "selfstat.gather"
        );
        for source in &self.collectors {
            let mut fields = BTreeMap::new();
            fields.insert(
                "collect_timeouts".to_owned(),
                FieldValue::UInt64(source.stats.collect_timeouts.load(Ordering::Relaxed)),
            );
            fields.insert(
                "collect_errors".to_owned(),
                FieldValue::UInt64(source.stats.collect_errors.load(Ordering::Relaxed)),
            );
            fields.insert(
                "filter_drops".to_owned(),
                FieldValue::UInt64(source.stats.filter_drops.load(Ordering::Relaxed)),
            );
            fields.insert(
                "ingress_drops".to_owned(),
                FieldValue::UInt64(source.stats.ingress_drops.load(Ordering::Relaxed)),
            );
            let mut tags = BTreeMap::new();
            tags.insert("alias".to_owned(), source.alias.clone());
            acc.add_counter("self_collector", fields, tags, None);
        }

        for source in &self.sinks {
            let stats = source.runner.stats();
            let buffer = source.runner.buffer_counters();
            let mut fields = BTreeMap::new();
            fields.insert(
                "connect_failures".to_owned(),
                FieldValue::UInt64(stats.connect_failures.load(Ordering::Relaxed)),
            );
            fields.insert(
                "write_failures".to_owned(),
                FieldValue::UInt64(stats.write_failures.load(Ordering::Relaxed)),
            );
            fields.insert(
                "flush_timeouts".to_owned(),
                FieldValue::UInt64(stats.flush_timeouts.load(Ordering::Relaxed)),
            );
            fields.insert("buffer_produced".to_owned(), FieldValue::UInt64(buffer.produced));
            fields.insert("buffer_committed".to_owned(), FieldValue::UInt64(buffer.committed));
            fields.insert("buffer_dropped".to_owned(), FieldValue::UInt64(buffer.dropped));
            fields.insert("buffer_held".to_owned(), FieldValue::UInt64(buffer.held));
            let mut tags = BTreeMap::new();
            tags.insert("alias".to_owned(), source.alias.clone());
            acc.add_counter("self_sink", fields, tags, None);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{SinkRunnerConfig, VecAccumulator};
    use std::time::Duration;

    struct NoopSink;

    #[async_trait]
    impl domain::SinkPlugin for NoopSink {
        fn sample_config(&self) -> &'static str {
            "# noop"
        }

        async fn connect(&mut self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn write(&mut self, _batch: &[domain::Measurement]) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reports_one_measurement_per_registered_collector() {
        let mut selfstat = SelfStatCollector::new();
        let stats = Arc::new(collector_runner::CollectorStats::default());
        stats.collect_errors.fetch_add(3, Ordering::Relaxed);
        selfstat.register_collector("cpu", Arc::clone(&stats));

        let acc = VecAccumulator::new();
        selfstat.gather(&acc).await.unwrap();
        let measurements = acc.take_measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].name(), "self_collector");
        assert_eq!(measurements[0].tags().get("alias").map(String::as_str), Some("cpu"));
        assert_eq!(measurements[0].fields().get("collect_errors"), Some(&FieldValue::UInt64(3)));
    }

    #[tokio::test]
    async fn reports_sink_counters_and_buffer_state() {
        let mut selfstat = SelfStatCollector::new();
        let cfg = SinkRunnerConfig::builder(Duration::from_secs(1), 10).build().unwrap();
        let runner = sink_runner::SinkRunner::new(Box::new(NoopSink), cfg);
        selfstat.register_sink("influx", Arc::clone(&runner));

        let acc = VecAccumulator::new();
        selfstat.gather(&acc).await.unwrap();
        let measurements = acc.take_measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].name(), "self_sink");
        assert_eq!(measurements[0].fields().get("buffer_produced"), Some(&FieldValue::UInt64(0)));
    }

    #[tokio::test]
    async fn empty_collector_reports_nothing() {
        let selfstat = SelfStatCollector::new();
        let acc = VecAccumulator::new();
        selfstat.gather(&acc).await.unwrap();
        assert!(acc.take_measurements().is_empty());
    }
}
