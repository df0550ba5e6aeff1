//! Top-level orchestrator (§4.7): materializes runners from an
//! [`AgentConfig`], starts them sinks-then-aggregators-then-collectors, and
//! on shutdown cancels them collectors-then-aggregators-then-sinks, waiting
//! for each stage to fully stop before cancelling the next. Generalizes the
//! teacher's `main_sqlite.rs` fixed three-stage `tokio::join!` wiring into a
//! registry-driven, arbitrary-N-runner agent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use aggregator::AggregatorRunner;
use collector_runner::{AggregatorRoute, CollectorRunner};
use domain::{
    Accumulator, AggregatorConfig, AggregatorPlugin, CollectorPlugin, CollectorRunnerConfig,
    FieldValue, Measurement, MeasurementKind, PluginError, SinkPlugin, SinkRunnerConfig, Timestamp,
};
use secrets::SecretGateway;
use selfstat::SelfStatCollector;
use sink_runner::SinkRunner;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Failure during [`Agent::load`]. Per §7, `ConfigInvalid` is the only
/// fatal-by-default condition in this core -- every other row of the error
/// table is handled locally by its owning runner and surfaced only as a
/// counter on the self-monitoring collector, never as an `AgentError`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Plugin construction, fan-out routing, or secret resolution failed
    /// while materializing runners from an [`AgentConfig`].
    #[error("agent config invalid: {reason}")]
    ConfigInvalid {
        /// Human-readable cause.
        reason: String,
    },
}

impl AgentError {
    fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid { reason: reason.into() }
    }
}

/// Named constructor table mapping a plugin type name to a factory that
/// builds a fresh boxed instance from its already secret-resolved
/// configuration text. Per Design Notes §9 "explicit constructor table":
/// this core never discovers plugins dynamically, it only looks names up.
#[derive(Default)]
pub struct PluginRegistry {
    collectors: HashMap<String, Box<dyn Fn(&str) -> Box<dyn CollectorPlugin> + Send + Sync>>,
    sinks: HashMap<String, Box<dyn Fn(&str) -> Box<dyn SinkPlugin> + Send + Sync>>,
    aggregators: HashMap<String, Box<dyn Fn(&str) -> Box<dyn AggregatorPlugin> + Send + Sync>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("collectors", &self.collectors.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .field("aggregators", &self.aggregators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// An empty registry with no plugin types registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector constructor under `plugin_type`.
    pub fn register_collector(
        &mut self,
        plugin_type: impl Into<String>,
        factory: impl Fn(&str) -> Box<dyn CollectorPlugin> + Send + Sync + 'static,
    ) {
        self.collectors.insert(plugin_type.into(), Box::new(factory));
    }

    /// Register a sink constructor under `plugin_type`.
    pub fn register_sink(
        &mut self,
        plugin_type: impl Into<String>,
        factory: impl Fn(&str) -> Box<dyn SinkPlugin> + Send + Sync + 'static,
    ) {
        self.sinks.insert(plugin_type.into(), Box::new(factory));
    }

    /// Register an aggregator constructor under `plugin_type`.
    pub fn register_aggregator(
        &mut self,
        plugin_type: impl Into<String>,
        factory: impl Fn(&str) -> Box<dyn AggregatorPlugin> + Send + Sync + 'static,
    ) {
        self.aggregators.insert(plugin_type.into(), Box::new(factory));
    }

    fn build_collector(&self, plugin_type: &str, config_text: &str) -> Result<Box<dyn CollectorPlugin>, AgentError> {
        let factory = self
            .collectors
            .get(plugin_type)
            .ok_or_else(|| AgentError::config_invalid(format!("unknown collector plugin type {plugin_type:?}")))?;
        Ok(factory(config_text))
    }

    fn build_sink(&self, plugin_type: &str, config_text: &str) -> Result<Box<dyn SinkPlugin>, AgentError> {
        let factory = self
            .sinks
            .get(plugin_type)
            .ok_or_else(|| AgentError::config_invalid(format!("unknown sink plugin type {plugin_type:?}")))?;
        Ok(factory(config_text))
    }

    fn build_aggregator(&self, plugin_type: &str, config_text: &str) -> Result<Box<dyn AggregatorPlugin>, AgentError> {
        let factory = self
            .aggregators
            .get(plugin_type)
            .ok_or_else(|| AgentError::config_invalid(format!("unknown aggregator plugin type {plugin_type:?}")))?;
        Ok(factory(config_text))
    }
}

/// One collector runner to materialize: which plugin type to build, its
/// (possibly secret-bearing) configuration text, its runner config, and
/// which sinks/aggregators it fans out to, by alias.
pub struct CollectorSpec {
    /// Identifier distinguishing this instance from others of the same type.
    pub alias: String,
    /// Key into the [`PluginRegistry`]'s collector table.
    pub plugin_type: String,
    /// Configuration text handed to the plugin factory, after secret
    /// resolution. May contain `@{store:key}` references.
    pub raw_config: String,
    /// The runner's tick/timeout/filter configuration.
    pub runner: CollectorRunnerConfig,
    /// Sink aliases this collector's surviving measurements fan out to.
    pub sinks: Vec<String>,
    /// Aggregator aliases this collector's measurements are offered to.
    pub aggregators: Vec<String>,
    /// Bounded capacity of each fan-out channel this collector feeds.
    pub fanout_capacity: usize,
}

/// One sink runner to materialize.
pub struct SinkSpec {
    /// Identifier distinguishing this instance from others of the same type.
    pub alias: String,
    /// Key into the [`PluginRegistry`]'s sink table.
    pub plugin_type: String,
    /// Configuration text handed to the plugin factory, after secret
    /// resolution.
    pub raw_config: String,
    /// The runner's flush/buffer/filter configuration.
    pub runner: SinkRunnerConfig,
}

/// One aggregator runner to materialize.
pub struct AggregatorSpec {
    /// Identifier distinguishing this instance from others of the same type.
    pub alias: String,
    /// Key into the [`PluginRegistry`]'s aggregator table.
    pub plugin_type: String,
    /// Configuration text handed to the plugin factory, after secret
    /// resolution.
    pub raw_config: String,
    /// The aggregator's period/delay/filter configuration.
    pub runner: AggregatorConfig,
    /// Sink aliases this aggregator's derived measurements fan out to.
    pub sinks: Vec<String>,
    /// Bounded capacity of the channel feeding this aggregator from
    /// collector runners.
    pub feed_capacity: usize,
}

/// The "already parsed, already validated" shape the out-of-scope
/// configuration collaborator would hand the core: a plugin registry plus
/// one typed spec per runner, and the secret gateway those specs'
/// configuration text is resolved against.
pub struct AgentConfig {
    /// The constructor table for every plugin type named below.
    pub registry: PluginRegistry,
    /// Secret store gateway, consulted to resolve `@{store:key}` references
    /// in every spec's `raw_config` before construction.
    pub secrets: SecretGateway,
    /// Sinks to materialize, started first.
    pub sinks: Vec<SinkSpec>,
    /// Aggregators to materialize, started second.
    pub aggregators: Vec<AggregatorSpec>,
    /// Collectors to materialize, started last.
    pub collectors: Vec<CollectorSpec>,
    /// How long `run`'s shutdown path waits for sinks to drain before
    /// dropping remaining buffered data with a warning.
    pub shutdown_deadline: Duration,
    /// Tick interval for the built-in self-monitoring collector.
    pub self_stat_interval: Duration,
    /// Fan-out capacity for the self-monitoring collector's own emissions.
    pub self_stat_fanout_capacity: usize,
}

/// Routes an aggregator's `push`-emitted derived measurements to the sinks
/// it is configured to feed. Aggregators have no aggregator-to-aggregator
/// chaining, so unlike a collector runner's accumulator this only fans out
/// to sinks.
struct AggregatorSinkAccumulator {
    sinks: Vec<mpsc::Sender<Measurement>>,
}

impl Accumulator for AggregatorSinkAccumulator {
    fn add_measurement(
        &self,
        kind: MeasurementKind,
        name: &str,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Option<Timestamp>,
    ) {
        let stamped_time = time.unwrap_or_default();
        let m = match Measurement::new(name, tags, fields, stamped_time, kind) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(error = %err, "agent.aggregator_invalid_measurement");
                return;
            }
        };
        let Some((last, rest)) = self.sinks.split_last() else { return };
        for sink in rest {
            if sink.try_send(m.clone()).is_err() {
                tracing::warn!("agent.aggregator_fanout_drop");
            }
        }
        if last.try_send(m).is_err() {
            tracing::warn!("agent.aggregator_fanout_drop");
        }
    }

    fn add_error(&self, err: PluginError) {
        tracing::warn!(error = %err, "agent.aggregator_push_error");
    }
}

/// A loaded, not-yet-started set of runners, ready for exactly one of
/// [`Agent::test`], [`Agent::run_once`], or [`Agent::run`].
///
/// Ingest/feed plumbing (the channels a collector fans out into) is spawned
/// during [`Agent::load`] itself -- only the periodic tick loops are
/// deferred, since `test`/`run_once`/`run` each drive them differently.
pub struct Agent {
    shutdown_deadline: Duration,
    sink_runners: Vec<(String, Arc<SinkRunner>)>,
    aggregator_runners: Vec<(String, Arc<AggregatorRunner>, Vec<mpsc::Sender<Measurement>>)>,
    collector_runners: Vec<(String, CollectorRunner)>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("sinks", &self.sink_runners.len())
            .field("aggregators", &self.aggregator_runners.len())
            .field("collectors", &self.collector_runners.len())
            .finish()
    }
}

impl Agent {
    /// Materialize runners from `config`: resolve each spec's secrets,
    /// build its plugin from the registry, and wire its fan-out. Fails
    /// atomically -- if any spec is invalid, no runner from this call is
    /// left partially wired.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ConfigInvalid`] for an unknown plugin type, a
    /// route naming an alias that doesn't exist, or a secret reference that
    /// fails to resolve.
    pub fn load(config: AgentConfig) -> Result<Self, AgentError> {
        let secrets = Arc::new(config.secrets);

        let mut sink_runners: BTreeMap<String, Arc<SinkRunner>> = BTreeMap::new();
        for spec in &config.sinks {
            let resolved = secrets
                .resolve_config(&spec.raw_config)
                .map_err(|err| AgentError::config_invalid(format!("sink {:?}: {err}", spec.alias)))?;
            let plugin = config.registry.build_sink(&spec.plugin_type, resolved.value())?;
            let runner = if resolved.has_dynamic() {
                let secrets = Arc::clone(&secrets);
                let resolved = resolved.clone();
                let alias = spec.alias.clone();
                SinkRunner::new_with_credential_refresh(
                    plugin,
                    spec.runner.clone(),
                    Some(Box::new(move || {
                        secrets.reresolve(&resolved).unwrap_or_else(|err| {
                            tracing::warn!(error = %err, alias = %alias, "agent.secret_reresolve_failed");
                            resolved.value().to_owned()
                        })
                    })),
                )
            } else {
                SinkRunner::new(plugin, spec.runner.clone())
            };
            sink_runners.insert(spec.alias.clone(), runner);
        }

        let mut aggregator_runners: BTreeMap<String, Arc<AggregatorRunner>> = BTreeMap::new();
        let mut aggregator_sinks: BTreeMap<String, Vec<mpsc::Sender<Measurement>>> = BTreeMap::new();
        for spec in &config.aggregators {
            let resolved = secrets
                .resolve_config(&spec.raw_config)
                .map_err(|err| AgentError::config_invalid(format!("aggregator {:?}: {err}", spec.alias)))?;
            let plugin = config.registry.build_aggregator(&spec.plugin_type, resolved.value())?;
            let runner = Arc::new(AggregatorRunner::new(plugin, spec.runner.clone()));

            let mut senders = Vec::with_capacity(spec.sinks.len());
            for sink_alias in &spec.sinks {
                let sink = sink_runners.get(sink_alias).ok_or_else(|| {
                    AgentError::config_invalid(format!(
                        "aggregator {:?} routes to unknown sink {sink_alias:?}",
                        spec.alias
                    ))
                })?;
                senders.push(sink.spawn_ingest(spec.feed_capacity));
            }
            aggregator_sinks.insert(spec.alias.clone(), senders);
            aggregator_runners.insert(spec.alias.clone(), runner);
        }

        let mut selfstat = SelfStatCollector::new();
        let mut collector_runners = Vec::with_capacity(config.collectors.len());
        for spec in &config.collectors {
            let resolved = secrets
                .resolve_config(&spec.raw_config)
                .map_err(|err| AgentError::config_invalid(format!("collector {:?}: {err}", spec.alias)))?;
            let plugin = config.registry.build_collector(&spec.plugin_type, resolved.value())?;

            let mut sink_senders = Vec::with_capacity(spec.sinks.len());
            for sink_alias in &spec.sinks {
                let sink = sink_runners.get(sink_alias).ok_or_else(|| {
                    AgentError::config_invalid(format!(
                        "collector {:?} routes to unknown sink {sink_alias:?}",
                        spec.alias
                    ))
                })?;
                sink_senders.push(sink.spawn_ingest(spec.fanout_capacity));
            }

            let mut aggregator_routes = Vec::with_capacity(spec.aggregators.len());
            for aggregator_alias in &spec.aggregators {
                let runner = aggregator_runners.get(aggregator_alias).ok_or_else(|| {
                    AgentError::config_invalid(format!(
                        "collector {:?} routes to unknown aggregator {aggregator_alias:?}",
                        spec.alias
                    ))
                })?;
                let sender = Arc::clone(runner).spawn_feed(spec.fanout_capacity);
                aggregator_routes.push(AggregatorRoute {
                    filter: runner.filter_handle(),
                    drop_originals: runner.drop_originals(),
                    sender,
                });
            }

            let runner = CollectorRunner::new(plugin, spec.runner.clone(), sink_senders, aggregator_routes);
            selfstat.register_collector(spec.alias.clone(), runner.stats());
            collector_runners.push((spec.alias.clone(), runner));
        }

        for (alias, sink) in &sink_runners {
            selfstat.register_sink(alias.clone(), Arc::clone(sink));
        }

        let selfstat_config = CollectorRunnerConfig::builder(config.self_stat_interval)
            .alias("selfstat")
            .build()
            .map_err(|err| AgentError::config_invalid(format!("built-in self collector: {err}")))?;
        let selfstat_sinks: Vec<_> = sink_runners
            .values()
            .map(|sink| sink.spawn_ingest(config.self_stat_fanout_capacity))
            .collect();
        collector_runners.push((
            "selfstat".to_owned(),
            CollectorRunner::new(Box::new(selfstat), selfstat_config, selfstat_sinks, Vec::new()),
        ));

        Ok(Self {
            shutdown_deadline: config.shutdown_deadline,
            sink_runners: sink_runners.into_iter().collect(),
            aggregator_runners: aggregator_runners
                .into_iter()
                .map(|(alias, runner)| {
                    let sinks = aggregator_sinks.remove(&alias).unwrap_or_default();
                    (alias, runner, sinks)
                })
                .collect(),
            collector_runners,
        })
    }

    /// Run exactly one collection tick per collector, routing every
    /// surviving measurement to the process log instead of a real sink, and
    /// touching no aggregator or sink. Returns the aggregate collector error
    /// count observed (`collect_errors + collect_timeouts` across all
    /// collectors).
    pub async fn test(self) -> usize {
        let mut total_measurements = 0usize;
        for (alias, collector) in &self.collector_runners {
            let measurements = collector.collect_once_for_test().await;
            for m in &measurements {
                tracing::info!(alias = %alias, name = m.name(), fields = ?m.fields(), "agent.test.measurement");
            }
            total_measurements += measurements.len();
        }
        let error_count = self.collector_error_count();
        tracing::info!(total_measurements, error_count, "agent.test.complete");
        error_count
    }

    /// Like [`Agent::test`] but routes through the real wired fan-out: each
    /// sink connects, every collector runs one tick, every aggregator
    /// performs one push, then every sink flushes once. Returns the
    /// aggregate collector and sink error count observed.
    pub async fn run_once(self) -> usize {
        let connect_cancel = CancellationToken::new();
        for (alias, sink) in &self.sink_runners {
            if !tokio::time::timeout(self.shutdown_deadline, sink.connect_once(&connect_cancel))
                .await
                .unwrap_or(false)
            {
                tracing::warn!(alias = %alias, "agent.run_once.connect_failed");
            }
        }

        for (_, collector) in &self.collector_runners {
            collector.collect_once_now().await;
        }

        for (_, aggregator, sinks) in &self.aggregator_runners {
            let acc: Arc<dyn Accumulator> = Arc::new(AggregatorSinkAccumulator { sinks: sinks.clone() });
            aggregator.push_once_now(&acc).await;
        }

        for (_, sink) in &self.sink_runners {
            sink.flush_once_pub().await;
        }

        self.collector_error_count() + self.sink_error_count()
    }

    /// Start every runner -- sinks, then aggregators, then collectors -- and
    /// block until `shutdown` fires. On shutdown, cancels collectors first,
    /// waits for them to stop, then cancels aggregators (each performs one
    /// final push if its window is partially full and not `drop_originals`),
    /// then cancels sinks (each drains until empty or
    /// `shutdown_deadline` elapses).
    pub async fn run(mut self, shutdown: CancellationToken) {
        let collectors_cancel = CancellationToken::new();
        let aggregators_cancel = CancellationToken::new();
        let sinks_cancel = CancellationToken::new();
        let deadline = self.shutdown_deadline;

        let sink_handles: Vec<JoinHandle<()>> = self
            .sink_runners
            .iter()
            .map(|(_, sink)| {
                let sink = Arc::clone(sink);
                let cancel = sinks_cancel.clone();
                tokio::spawn(async move { sink.run(cancel, deadline).await })
            })
            .collect();

        let aggregator_handles: Vec<JoinHandle<()>> = self
            .aggregator_runners
            .iter()
            .map(|(_, aggregator, sinks)| {
                let aggregator = Arc::clone(aggregator);
                let acc: Arc<dyn Accumulator> = Arc::new(AggregatorSinkAccumulator { sinks: sinks.clone() });
                let cancel = aggregators_cancel.clone();
                tokio::spawn(async move { aggregator.run(acc, cancel).await })
            })
            .collect();

        let collector_runners = std::mem::take(&mut self.collector_runners);
        let collector_handles: Vec<JoinHandle<()>> = collector_runners
            .into_iter()
            .map(|(alias, mut collector)| {
                let cancel = collectors_cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = collector.run(cancel).await {
                        tracing::warn!(alias = %alias, error = %err, "agent.collector_init_failed");
                    }
                })
            })
            .collect();

        shutdown.cancelled().await;
        tracing::info!("agent.run.shutdown_requested");

        collectors_cancel.cancel();
        for handle in collector_handles {
            let _ = handle.await;
        }

        aggregators_cancel.cancel();
        for handle in aggregator_handles {
            let _ = handle.await;
        }

        sinks_cancel.cancel();
        for handle in sink_handles {
            let _ = handle.await;
        }
        tracing::info!("agent.run.shutdown_complete");
    }

    /// Load `new_config` as a fresh agent, drain this agent's sink buffers
    /// into the replacement sink sharing the same alias (a pragmatic
    /// reading of "signatures match", since no runner here has started its
    /// tick loop yet at reload time), then return the replacement. This
    /// agent's ingest/feed background tasks stop on their own once it is
    /// dropped: their channel senders live inside the `CollectorRunner`/
    /// `AggregatorRunner` instances this struct owns, so dropping `self`
    /// drops the senders, and each task's `recv` loop exits when its sender
    /// side closes.
    ///
    /// # Errors
    ///
    /// Returns whatever [`Agent::load`] returns for `new_config`.
    pub async fn reload(self, new_config: AgentConfig) -> Result<Agent, AgentError> {
        let new_agent = Agent::load(new_config)?;
        for (alias, old_sink) in &self.sink_runners {
            let Some((_, new_sink)) = new_agent.sink_runners.iter().find(|(a, _)| a == alias) else {
                continue;
            };
            let batch = old_sink.drain_all();
            if !batch.is_empty() {
                tracing::info!(alias = %alias, count = batch.len(), "agent.reload.drained");
                new_sink.ingest_batch(batch);
            }
        }
        Ok(new_agent)
    }

    fn collector_error_count(&self) -> usize {
        self.collector_runners
            .iter()
            .map(|(_, collector)| {
                let stats = collector.stats();
                let errors = stats.collect_errors.load(Ordering::Relaxed) + stats.collect_timeouts.load(Ordering::Relaxed);
                usize::try_from(errors).unwrap_or(usize::MAX)
            })
            .sum()
    }

    fn sink_error_count(&self) -> usize {
        self.sink_runners
            .iter()
            .map(|(_, sink)| {
                let stats = sink.stats();
                let errors = stats.connect_failures.load(Ordering::Relaxed)
                    + stats.write_failures.load(Ordering::Relaxed)
                    + stats.flush_timeouts.load(Ordering::Relaxed);
                usize::try_from(errors).unwrap_or(usize::MAX)
            })
            .sum()
    }
}
