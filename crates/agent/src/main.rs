//! `metricsagentd` -- demo entry point wiring a `RandomGaugeCollector` into a
//! `StdoutSink`, the way `fraud_detection/src/main_sqlite.rs` wires
//! `DemoModel` into `SqliteStorage`. Minimal `run-once`/`run` mode switch,
//! no `clap`: the textual configuration surface is out of scope here, this
//! binary only proves the core wires together and runs.
//!
//! # Usage
//!
//! ```text
//! $env:RUST_LOG='info'; cargo run --bin metricsagentd; Remove-Item env:RUST_LOG
//! cargo run --bin metricsagentd -- run-once
//! cargo run --bin metricsagentd -- test
//! ```
//!
//! Unlike the teacher's `current_thread` demo binaries, this one uses the
//! default multi-thread runtime: spec.md's concurrency model calls for
//! parallel cooperative tasks on a work-stealing runtime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agent::{Agent, AgentConfig, CollectorSpec, PluginRegistry, SinkSpec};
use anyhow::Context as _;
use async_trait::async_trait;
use domain::{Accumulator, CollectorPlugin, FieldValue, Measurement, PluginError, SinkPlugin};
use rand::Rng as _;
use secrets::SecretGateway;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Emits one gauge measurement per tick, with a value sampled uniformly from
/// `[min, max)`. Demo collector standing in for a real host/process probe,
/// the way the teacher's `DemoModel` stands in for a real fraud model.
struct RandomGaugeCollector {
    min: f64,
    max: f64,
}

#[async_trait]
impl CollectorPlugin for RandomGaugeCollector {
    fn sample_config(&self) -> &'static str {
        "# [[collectors.random_gauge]]\n# min = 0.0\n# max = 100.0\n"
    }

    async fn gather(&self, acc: &dyn Accumulator) -> Result<(), PluginError> {
        let value = rand::rng().random_range(self.min..self.max);
        let mut fields = BTreeMap::new();
        fields.insert("value".to_owned(), FieldValue::Float64(value));
        acc.add_gauge("random_gauge", fields, BTreeMap::new(), None);
        Ok(())
    }
}

/// Demo push-style collector standing in for one that consumes an upstream
/// message queue: `start` wraps the runner's accumulator in
/// `domain::with_tracking` so it can watch for a delivery token every
/// `group_size` measurements and ack them upstream (logged here in place of
/// a real queue client's ack call). `stop` aborts the background producer.
struct QueueCollector {
    group_size: usize,
    producer: Option<JoinHandle<()>>,
    acker: Option<JoinHandle<()>>,
}

#[async_trait]
impl CollectorPlugin for QueueCollector {
    fn sample_config(&self) -> &'static str {
        "# [[collectors.queue]]\n# group_size = 5\n"
    }

    async fn gather(&self, _acc: &dyn Accumulator) -> Result<(), PluginError> {
        Ok(())
    }

    async fn start(&mut self, acc: Arc<dyn Accumulator>) -> Result<(), PluginError> {
        let (tracking, mut tokens) = domain::with_tracking(self.group_size, acc);
        let tracking = Arc::new(tracking);

        let emit_tracking = Arc::clone(&tracking);
        self.producer = Some(tokio::spawn(async move {
            let mut n: i64 = 0;
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                n += 1;
                let mut fields = BTreeMap::new();
                fields.insert("value".to_owned(), FieldValue::Int64(n));
                emit_tracking.add_counter("queue_messages", fields, BTreeMap::new(), None);
            }
        }));

        self.acker = Some(tokio::spawn(async move {
            while let Some(token) = tokens.recv().await {
                tracing::debug!(token, "metricsagentd.queue_ack_group");
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(handle) = self.producer.take() {
            handle.abort();
        }
        if let Some(handle) = self.acker.take() {
            handle.abort();
        }
    }
}

/// Writes each batch's measurements to stdout, one line per measurement.
/// Demo sink standing in for a real network sink, the way the teacher's
/// `SqliteStorage` stands in for a production store in `main_sqlite.rs`.
struct StdoutSink;

#[async_trait]
impl SinkPlugin for StdoutSink {
    fn sample_config(&self) -> &'static str {
        "# [[sinks.stdout]]\n"
    }

    async fn connect(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn write(&mut self, batch: &[Measurement]) -> Result<(), PluginError> {
        use std::io::Write as _;
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for m in batch {
            writeln!(handle, "{} {:?} {:?}", m.name(), m.tags(), m.fields())
                .map_err(|e| PluginError::from_source("failed to write to stdout", e))?;
        }
        Ok(())
    }
}

fn demo_config() -> anyhow::Result<AgentConfig> {
    let mut registry = PluginRegistry::new();
    registry.register_collector("random_gauge", |_cfg| Box::new(RandomGaugeCollector { min: 0.0, max: 100.0 }));
    registry.register_collector("queue", |_cfg| {
        Box::new(QueueCollector { group_size: 5, producer: None, acker: None })
    });
    registry.register_sink("stdout", |_cfg| Box::new(StdoutSink));

    Ok(AgentConfig {
        registry,
        secrets: SecretGateway::new(),
        sinks: vec![SinkSpec {
            alias: "stdout".to_owned(),
            plugin_type: "stdout".to_owned(),
            raw_config: String::new(),
            runner: domain::SinkRunnerConfig::builder(Duration::from_secs(5), 1_000)
                .build()
                .context("failed to build stdout sink runner config")?,
        }],
        aggregators: Vec::new(),
        collectors: vec![CollectorSpec {
            alias: "random_gauge".to_owned(),
            plugin_type: "random_gauge".to_owned(),
            raw_config: String::new(),
            runner: domain::CollectorRunnerConfig::builder(Duration::from_secs(2))
                .alias("random_gauge")
                .build()
                .context("failed to build random_gauge collector runner config")?,
            sinks: vec!["stdout".to_owned()],
            aggregators: Vec::new(),
            fanout_capacity: 100,
        }, CollectorSpec {
            alias: "queue".to_owned(),
            plugin_type: "queue".to_owned(),
            raw_config: String::new(),
            runner: domain::CollectorRunnerConfig::builder(Duration::from_secs(3600))
                .alias("queue")
                .build()
                .context("failed to build queue collector runner config")?,
            sinks: vec!["stdout".to_owned()],
            aggregators: Vec::new(),
            fanout_capacity: 100,
        }],
        shutdown_deadline: Duration::from_secs(5),
        self_stat_interval: Duration::from_secs(60),
        self_stat_fanout_capacity: 100,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "run".to_owned());

    let config = demo_config().context("failed to build demo agent config")?;
    let agent = Agent::load(config).context("failed to load agent")?;

    match mode.as_str() {
        "test" => {
            let errors = agent.test().await;
            tracing::info!(errors, "metricsagentd.test.complete");
        }
        "run-once" => {
            let errors = agent.run_once().await;
            tracing::info!(errors, "metricsagentd.run_once.complete");
        }
        "run" => {
            let shutdown = CancellationToken::new();
            let run_shutdown = shutdown.clone();
            let run_handle = tokio::spawn(agent.run(run_shutdown));
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
            tracing::info!("metricsagentd.shutdown: ctrl_c received");
            shutdown.cancel();
            run_handle.await.context("agent run task panicked")?;
        }
        other => anyhow::bail!("unknown mode {other:?}, expected one of: test, run-once, run"),
    }

    Ok(())
}
