//! Wraps a collector plugin, owns its periodic tick, enforces its timeout,
//! and funnels its emissions through a filter chain into the downstream
//! fan-out (§4.4).
//!
//! Entry point: [`CollectorRunner::run`]. Configuration via
//! [`domain::CollectorRunnerConfig::builder`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::{
    Accumulator, CollectorPlugin, CollectorRunnerConfig, FieldValue, Measurement, MeasurementKind,
    PluginError, Timestamp,
};
use filterchain::FilterChain;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A downstream aggregator this runner's fan-out offers matched measurements
/// to. `filter` is the aggregator's own compiled chain (shared via
/// [`aggregator::AggregatorRunner::filter_handle`] in the owning crate, kept
/// here as a plain `Arc<FilterChain>` so this crate need not depend on
/// `aggregator`), `sender` feeds its ingest task.
#[derive(Debug, Clone)]
pub struct AggregatorRoute {
    /// The aggregator's compiled filter chain.
    pub filter: Arc<FilterChain>,
    /// Whether a match here consumes the measurement (see §4.3 `drop_originals`).
    pub drop_originals: bool,
    /// Bounded channel feeding the aggregator's ingest task.
    pub sender: mpsc::Sender<Measurement>,
}

/// Error-kind counters for one collector runner, consulted by the
/// self-monitoring collector.
#[derive(Debug, Default)]
pub struct CollectorStats {
    /// `gather` exceeded its timeout.
    pub collect_timeouts: AtomicU64,
    /// `gather` returned an error.
    pub collect_errors: AtomicU64,
    /// A measurement was rejected by this runner's filter chain.
    pub filter_drops: AtomicU64,
    /// A measurement was dropped because a fan-out channel was full.
    pub ingress_drops: AtomicU64,
}

/// Wraps one [`CollectorPlugin`], owning its tick schedule and fan-out
/// targets. Not `Clone`/`Send`-shared across tasks: one runner, one task.
pub struct CollectorRunner {
    plugin: Box<dyn CollectorPlugin>,
    config: CollectorRunnerConfig,
    filter: Arc<FilterChain>,
    sinks: Vec<mpsc::Sender<Measurement>>,
    aggregators: Vec<AggregatorRoute>,
    stats: Arc<CollectorStats>,
}

impl CollectorRunner {
    /// Build a runner from its plugin, config, and fan-out targets.
    #[must_use]
    pub fn new(
        plugin: Box<dyn CollectorPlugin>,
        config: CollectorRunnerConfig,
        sinks: Vec<mpsc::Sender<Measurement>>,
        aggregators: Vec<AggregatorRoute>,
    ) -> Self {
        let filter = Arc::new(FilterChain::compile(config.filter.clone()));
        Self {
            plugin,
            config,
            filter,
            sinks,
            aggregators,
            stats: Arc::new(CollectorStats::default()),
        }
    }

    /// Shared handle to this runner's error-kind counters.
    #[must_use]
    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    /// Run exactly one collection tick, right now, bounded by `timeout`.
    /// Used by `Agent::run_once()` (§4.7), which needs a single pass through
    /// this runner's real wired fan-out rather than the periodic schedule.
    pub async fn collect_once_now(&self) {
        self.collect_once(Timestamp::now()).await;
    }

    /// Run one collection tick right now, capturing every measurement that
    /// survives this runner's filter chain instead of sending it to the
    /// wired fan-out. Used by `Agent::test()` (§4.7) for a dry run that
    /// never touches a real sink or aggregator.
    pub async fn collect_once_for_test(&self) -> Vec<Measurement> {
        let captured = std::sync::Mutex::new(Vec::new());
        let acc = RunnerAccumulator {
            tick_time: Timestamp::now().rounded_to(self.config.precision),
            name_override: self.config.name_override.as_deref(),
            extra_tags: &self.config.extra_tags,
            filter: &self.filter,
            sinks: &self.sinks,
            aggregators: &self.aggregators,
            stats: &self.stats,
            capture: Some(&captured),
        };
        match tokio::time::timeout(self.config.timeout, self.plugin.gather(&acc)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = %err, alias = ?self.config.alias, "collector_runner.test_gather_error");
                self.stats.collect_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_elapsed) => {
                tracing::warn!(alias = ?self.config.alias, "collector_runner.test_gather_timeout");
                self.stats.collect_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
        captured.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run the periodic tick loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the [`PluginError`] from [`CollectorPlugin::init`] if it
    /// fails; per §4.4 this aborts only this runner.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), PluginError> {
        self.plugin.init().await?;

        let push_acc: Arc<dyn Accumulator> = Arc::new(PushAccumulator {
            name_override: self.config.name_override.clone(),
            extra_tags: self.config.extra_tags.clone(),
            filter: Arc::clone(&self.filter),
            sinks: self.sinks.clone(),
            aggregators: self.aggregators.clone(),
            stats: Arc::clone(&self.stats),
        });
        self.plugin.start(push_acc).await?;

        let first = Self::first_tick(self.config.interval, self.config.jitter, self.config.round_interval);
        let mut ticker = tokio::time::interval_at(first, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _instant = ticker.tick() => {
                    self.collect_once(Timestamp::now()).await;
                }
            }
        }

        self.plugin.stop().await;
        Ok(())
    }

    async fn collect_once(&self, tick_time: Timestamp) {
        let acc = RunnerAccumulator {
            tick_time: tick_time.rounded_to(self.config.precision),
            name_override: self.config.name_override.as_deref(),
            extra_tags: &self.config.extra_tags,
            filter: &self.filter,
            sinks: &self.sinks,
            aggregators: &self.aggregators,
            stats: &self.stats,
            capture: None,
        };

        match tokio::time::timeout(self.config.timeout, self.plugin.gather(&acc)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = %err, alias = ?self.config.alias, "collector_runner.gather_error");
                self.stats.collect_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_elapsed) => {
                tracing::warn!(alias = ?self.config.alias, timeout = ?self.config.timeout, "collector_runner.gather_timeout");
                self.stats.collect_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// First tick instant: `now + rand([0, jitter)) + interval`, with the
    /// wall-clock alignment to the next `interval` boundary applied first
    /// when `round_interval` is set (then jitter is added on top).
    fn first_tick(interval: Duration, jitter: Duration, round_interval: bool) -> Instant {
        let jitter_dur = random_jitter(jitter);
        if round_interval {
            let now_wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            let interval_nanos = interval.as_nanos().max(1);
            let now_nanos = now_wall.as_nanos();
            let next_boundary_nanos = (now_nanos / interval_nanos + 1) * interval_nanos;
            let wait_nanos = next_boundary_nanos - now_nanos;
            #[expect(
                clippy::cast_possible_truncation,
                reason = "one interval's worth of nanoseconds always fits u64 for any realistic interval"
            )]
            let wait = Duration::from_nanos(wait_nanos as u64) + jitter_dur;
            Instant::now() + wait
        } else {
            Instant::now() + interval + jitter_dur
        }
    }
}

fn random_jitter(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    let nanos = jitter.as_nanos().max(1);
    let sampled = rand::rng().random_range(0..nanos);
    #[expect(
        clippy::cast_possible_truncation,
        reason = "jitter is a configuration value expected to be well under u64::MAX nanoseconds"
    )]
    Duration::from_nanos(sampled as u64)
}

/// The accumulator passed to [`CollectorPlugin::gather`] for one tick:
/// validates, stamps, tags, filters, and fans out every measurement a
/// collector plugin emits (§4.4 step 2).
struct RunnerAccumulator<'a> {
    tick_time: Timestamp,
    name_override: Option<&'a str>,
    extra_tags: &'a BTreeMap<String, String>,
    filter: &'a FilterChain,
    sinks: &'a [mpsc::Sender<Measurement>],
    aggregators: &'a [AggregatorRoute],
    stats: &'a CollectorStats,
    /// When set, admitted measurements are pushed here instead of this
    /// runner's wired fan-out -- see [`CollectorRunner::collect_once_for_test`].
    capture: Option<&'a std::sync::Mutex<Vec<Measurement>>>,
}

impl RunnerAccumulator<'_> {
    fn dispatch(&self, mut m: Measurement) {
        if !self.filter.apply(&mut m) {
            self.stats.filter_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(capture) = self.capture {
            capture.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(m);
            return;
        }

        let mut consumed = false;
        for route in self.aggregators {
            if route.filter.matches(&m) {
                if route.sender.try_send(m.clone()).is_err() {
                    self.stats.ingress_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("collector_runner.aggregator_fanout_drop");
                }
                if route.drop_originals {
                    consumed = true;
                }
            }
        }
        if consumed {
            return;
        }

        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            if sink.try_send(m.clone()).is_err() {
                self.stats.ingress_drops.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("collector_runner.sink_fanout_drop");
            }
        }
        if last.try_send(m).is_err() {
            self.stats.ingress_drops.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("collector_runner.sink_fanout_drop");
        }
    }
}

impl Accumulator for RunnerAccumulator<'_> {
    fn add_measurement(
        &self,
        kind: MeasurementKind,
        name: &str,
        mut tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Option<Timestamp>,
    ) {
        let name = self.name_override.unwrap_or(name);
        for (key, value) in self.extra_tags {
            tags.insert(key.clone(), value.clone());
        }
        let stamped_time = time.unwrap_or(self.tick_time);
        match Measurement::new(name, tags, fields, stamped_time, kind) {
            Ok(m) => self.dispatch(m),
            Err(err) => self.add_error(PluginError::from_source("invalid measurement emitted by collector", err)),
        }
    }

    fn add_error(&self, err: PluginError) {
        tracing::warn!(error = %err, "collector_runner.collect_error");
        self.stats.collect_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// The accumulator handed to [`CollectorPlugin::start`] for push-style
/// collectors (§6): owns its fan-out targets (rather than borrowing them for
/// one tick, like [`RunnerAccumulator`]) since the plugin may hold it for the
/// runner's entire lifetime. Measurements with no explicit `time` are
/// stamped with wall-clock now -- there is no "tick time" to fall back on
/// since emissions arrive on the plugin's own schedule, not the runner's.
struct PushAccumulator {
    name_override: Option<String>,
    extra_tags: BTreeMap<String, String>,
    filter: Arc<FilterChain>,
    sinks: Vec<mpsc::Sender<Measurement>>,
    aggregators: Vec<AggregatorRoute>,
    stats: Arc<CollectorStats>,
}

impl PushAccumulator {
    fn dispatch(&self, mut m: Measurement) {
        if !self.filter.apply(&mut m) {
            self.stats.filter_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut consumed = false;
        for route in &self.aggregators {
            if route.filter.matches(&m) {
                if route.sender.try_send(m.clone()).is_err() {
                    self.stats.ingress_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("collector_runner.aggregator_fanout_drop");
                }
                if route.drop_originals {
                    consumed = true;
                }
            }
        }
        if consumed {
            return;
        }

        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            if sink.try_send(m.clone()).is_err() {
                self.stats.ingress_drops.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("collector_runner.sink_fanout_drop");
            }
        }
        if last.try_send(m).is_err() {
            self.stats.ingress_drops.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("collector_runner.sink_fanout_drop");
        }
    }
}

impl Accumulator for PushAccumulator {
    fn add_measurement(
        &self,
        kind: MeasurementKind,
        name: &str,
        mut tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Option<Timestamp>,
    ) {
        let name = self.name_override.as_deref().unwrap_or(name);
        for (key, value) in &self.extra_tags {
            tags.insert(key.clone(), value.clone());
        }
        let stamped_time = time.unwrap_or_else(Timestamp::now);
        match Measurement::new(name, tags, fields, stamped_time, kind) {
            Ok(m) => self.dispatch(m),
            Err(err) => self.add_error(PluginError::from_source("invalid measurement emitted by collector", err)),
        }
    }

    fn add_error(&self, err: PluginError) {
        tracing::warn!(error = %err, "collector_runner.collect_error");
        self.stats.collect_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedCollector {
        value: i64,
    }

    #[async_trait]
    impl CollectorPlugin for FixedCollector {
        fn sample_config(&self) -> &'static str {
            "# fixed"
        }

        async fn gather(&self, acc: &dyn Accumulator) -> Result<(), PluginError> {
            let mut fields = BTreeMap::new();
            fields.insert("value".to_owned(), FieldValue::Int64(self.value));
            acc.add_gauge("fixed", fields, BTreeMap::new(), None);
            Ok(())
        }
    }

    struct FailingCollector;

    #[async_trait]
    impl CollectorPlugin for FailingCollector {
        fn sample_config(&self) -> &'static str {
            "# failing"
        }

        async fn gather(&self, _acc: &dyn Accumulator) -> Result<(), PluginError> {
            Err(PluginError::new("boom"))
        }
    }

    struct HangingCollector;

    #[async_trait]
    impl CollectorPlugin for HangingCollector {
        fn sample_config(&self) -> &'static str {
            "# hanging"
        }

        async fn gather(&self, _acc: &dyn Accumulator) -> Result<(), PluginError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn config() -> CollectorRunnerConfig {
        CollectorRunnerConfig::builder(Duration::from_secs(1)).build().unwrap()
    }

    #[tokio::test]
    async fn gathered_measurement_reaches_sink_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let runner = CollectorRunner::new(Box::new(FixedCollector { value: 7 }), config(), vec![tx], vec![]);
        runner.collect_once_now().await;
        let received = rx.try_recv().unwrap();
        assert_eq!(received.name(), "fixed");
        assert_eq!(received.fields().get("value"), Some(&FieldValue::Int64(7)));
    }

    #[tokio::test]
    async fn collector_error_is_counted_not_propagated() {
        let (tx, _rx) = mpsc::channel(8);
        let runner = CollectorRunner::new(Box::new(FailingCollector), config(), vec![tx], vec![]);
        runner.collect_once_now().await;
        assert_eq!(runner.stats().collect_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_gather_is_counted_as_timeout() {
        let (tx, _rx) = mpsc::channel(8);
        let cfg = CollectorRunnerConfig::builder(Duration::from_secs(1))
            .timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        let runner = CollectorRunner::new(Box::new(HangingCollector), cfg, vec![tx], vec![]);
        runner.collect_once_now().await;
        assert_eq!(runner.stats().collect_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn name_override_and_extra_tags_applied() {
        let (tx, mut rx) = mpsc::channel(8);
        let cfg = CollectorRunnerConfig::builder(Duration::from_secs(1))
            .name_override("renamed")
            .extra_tag("region", "us")
            .build()
            .unwrap();
        let runner = CollectorRunner::new(Box::new(FixedCollector { value: 1 }), cfg, vec![tx], vec![]);
        runner.collect_once_now().await;
        let received = rx.try_recv().unwrap();
        assert_eq!(received.name(), "renamed");
        assert_eq!(received.tags().get("region").map(String::as_str), Some("us"));
    }

    struct PushCollector {
        started: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl CollectorPlugin for PushCollector {
        fn sample_config(&self) -> &'static str {
            "# push"
        }

        async fn gather(&self, _acc: &dyn Accumulator) -> Result<(), PluginError> {
            Ok(())
        }

        async fn start(&mut self, acc: Arc<dyn Accumulator>) -> Result<(), PluginError> {
            let mut fields = BTreeMap::new();
            fields.insert("value".to_owned(), FieldValue::Int64(42));
            acc.add_gauge("pushed", fields, BTreeMap::new(), None);
            let _ = self.started.send(());
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_style_start_delivers_to_sink_without_waiting_for_a_tick() {
        let (tx, mut rx) = mpsc::channel(8);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let cfg = CollectorRunnerConfig::builder(Duration::from_secs(3600)).build().unwrap();
        let mut runner = CollectorRunner::new(Box::new(PushCollector { started: started_tx }), cfg, vec![tx], vec![]);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            runner.run(run_cancel).await.unwrap();
            runner
        });

        started_rx.recv().await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "pushed");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn full_sink_channel_counts_ingress_drop() {
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(
            Measurement::new(
                "filler",
                BTreeMap::new(),
                [("x".to_owned(), FieldValue::Int64(0))].into_iter().collect(),
                Timestamp::now(),
                MeasurementKind::Gauge,
            )
            .unwrap(),
        )
        .unwrap();
        let runner = CollectorRunner::new(Box::new(FixedCollector { value: 1 }), config(), vec![tx], vec![]);
        runner.collect_once_now().await;
        assert_eq!(runner.stats().ingress_drops.load(Ordering::Relaxed), 1);
    }
}
