//! Owns one sink plugin's buffer, flush schedule, and connect lifecycle
//! (§4.5). Generalizes the teacher's `consumer::Consumer` read-infer-write
//! loop into a buffered, backoff-and-retry flush loop: the teacher's
//! `Modelizer`/`Alarm` inference step has no counterpart here, but the
//! pattern of "pull a batch, hand it to one external port, stop cleanly on
//! cancellation" carries over directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use domain::{Measurement, PluginError, SinkRunnerConfig};
use filterchain::FilterChain;
use rand::Rng;
use runbuffer::RunningBuffer;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// Counters surfaced to the self-monitoring collector (§7).
#[derive(Debug, Default)]
pub struct SinkStats {
    /// `connect` returned an error.
    pub connect_failures: std::sync::atomic::AtomicU64,
    /// `write` returned an error (including connection-lost failures).
    pub write_failures: std::sync::atomic::AtomicU64,
    /// `write` exceeded its flush timeout.
    pub flush_timeouts: std::sync::atomic::AtomicU64,
}

/// Snapshot of a sink's running buffer counters, for the self-monitoring
/// collector (§7 invariant 1: `produced == committed + dropped + held`).
#[derive(Debug, Clone, Copy)]
pub struct BufferCounters {
    /// Total measurements ever admitted into the buffer.
    pub produced: u64,
    /// Total measurements permanently committed (accepted by the sink).
    pub committed: u64,
    /// Total measurements permanently dropped (overflow or reject-overflow).
    pub dropped: u64,
    /// Measurements currently sitting in the buffer.
    pub held: u64,
}

/// The outcome of one flush attempt, distinguishing a lost connection from
/// an ordinary retryable failure so the run loop knows whether to cycle
/// `close`/`connect` before the next attempt.
enum FlushOutcome {
    Ok,
    Retryable,
    ConnectionLost,
}

/// Wraps one [`domain::SinkPlugin`] with its own filter chain, running
/// buffer, and flush schedule.
///
/// Boxed as `Box<dyn SinkPlugin>` inside, since the agent holds a
/// heterogeneous set of sink runners side by side. The plugin is held behind
/// a `tokio::sync::Mutex` even though only this runner's own `run` task ever
/// touches it: the mutex exists so `SinkRunner` can be shared via `Arc` with
/// [`SinkRunner::spawn_ingest`], which needs `&self` access alongside `run`'s
/// need for `&mut` plugin calls.
pub struct SinkRunner {
    plugin: Mutex<Box<dyn domain::SinkPlugin>>,
    config: SinkRunnerConfig,
    filter: FilterChain,
    buffer: RunningBuffer,
    flush_notify: Notify,
    ready: AtomicBool,
    stats: Arc<SinkStats>,
    /// Re-fetches this sink's configuration text when it carries a dynamic
    /// secret reference (§4.8). `None` for sinks whose configuration has
    /// nothing dynamic in it -- the common case.
    credential_refresh: Option<Box<dyn Fn() -> String + Send + Sync>>,
}

impl SinkRunner {
    /// Wrap `plugin` with `config`, compiling its filter chain and sizing its
    /// running buffer.
    #[must_use]
    pub fn new(plugin: Box<dyn domain::SinkPlugin>, config: SinkRunnerConfig) -> Arc<Self> {
        Self::new_with_credential_refresh(plugin, config, None)
    }

    /// Like [`SinkRunner::new`], but re-applies `credential_refresh`'s
    /// result via [`domain::SinkPlugin::reconfigure`] before every connect
    /// attempt -- for a sink whose configuration carries a dynamic secret
    /// reference that must be re-resolved on each reconnect.
    #[must_use]
    pub fn new_with_credential_refresh(
        plugin: Box<dyn domain::SinkPlugin>,
        config: SinkRunnerConfig,
        credential_refresh: Option<Box<dyn Fn() -> String + Send + Sync>>,
    ) -> Arc<Self> {
        let filter = FilterChain::compile(config.filter.clone());
        let gated = config.startup_gated || plugin.startup_gated();
        Arc::new(Self {
            buffer: RunningBuffer::new(config.buffer_capacity),
            plugin: Mutex::new(plugin),
            config,
            filter,
            flush_notify: Notify::new(),
            ready: AtomicBool::new(!gated),
            stats: Arc::new(SinkStats::default()),
            credential_refresh,
        })
    }

    /// Shared handle to this sink's counters.
    #[must_use]
    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    /// Signal that this sink may now flush. No-op if it was never gated.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.flush_notify.notify_one();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Snapshot of this sink's running buffer counters.
    #[must_use]
    pub fn buffer_counters(&self) -> BufferCounters {
        #[expect(clippy::cast_possible_truncation, reason = "buffer length fits u64 for any realistic capacity")]
        let held = self.buffer.len() as u64;
        BufferCounters {
            produced: self.buffer.produced(),
            committed: self.buffer.committed(),
            dropped: self.buffer.dropped(),
            held,
        }
    }

    /// Apply this sink's filter chain to each of `batch` and admit survivors
    /// into the running buffer, exactly as [`SinkRunner::spawn_ingest`]'s
    /// background task does per message. Used by `Agent::reload` to hand a
    /// predecessor sink's drained buffer to its replacement synchronously,
    /// without spawning another ingest task.
    pub fn ingest_batch(&self, batch: Vec<Measurement>) {
        for mut m in batch {
            if self.filter.apply(&mut m) {
                self.buffer.add(m);
            }
        }
        if self.buffer.len() >= self.config.metric_batch_size {
            self.flush_notify.notify_one();
        }
    }

    /// Connect, retrying with backoff until it succeeds or `cancel` fires.
    /// Used directly by `Agent::run_once` (§4.7), which has no ongoing flush
    /// loop to perform the connect step implicitly.
    pub async fn connect_once(&self, cancel: &CancellationToken) -> bool {
        self.connect_with_backoff(cancel).await
    }

    /// Perform exactly one flush attempt (drain up to `metric_batch_size`,
    /// write, commit or reject), discarding the outcome. Used by
    /// `Agent::run_once`, which only needs the side effect.
    pub async fn flush_once_pub(&self) {
        let _ = self.flush_once().await;
    }

    /// Drain every currently buffered measurement, committing them from this
    /// runner's perspective. Used by `Agent::reload` to hand buffered data
    /// off to a replacement sink sharing the same alias rather than dropping
    /// it at swap time.
    #[must_use]
    pub fn drain_all(&self) -> Vec<Measurement> {
        let handle = self.buffer.drain(usize::MAX);
        let batch = handle.batch().to_vec();
        handle.commit();
        batch
    }

    /// Spawn a background task that applies this sink's filter chain to every
    /// measurement sent on the returned channel, then admits the survivors
    /// into the running buffer. Requesting an immediate flush once the
    /// buffer reaches `metric_batch_size`, coalescing with the time-based
    /// tick rather than scheduling a second one.
    #[must_use]
    pub fn spawn_ingest(self: &Arc<Self>, capacity: usize) -> mpsc::Sender<Measurement> {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(mut m) = rx.recv().await {
                if !this.filter.apply(&mut m) {
                    continue;
                }
                this.buffer.add(m);
                if this.buffer.len() >= this.config.metric_batch_size {
                    this.flush_notify.notify_one();
                }
            }
        });
        tx
    }

    /// Run the connect-then-flush loop until `cancel` fires. On
    /// cancellation, drains the buffer until empty or `shutdown_deadline`
    /// elapses, whichever comes first, logging and abandoning any remainder.
    pub async fn run(&self, cancel: CancellationToken, shutdown_deadline: Duration) {
        if !self.connect_with_backoff(&cancel).await {
            return;
        }

        let mut consecutive_failures: u32 = 0;
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.drain_until_empty_or_deadline(shutdown_deadline).await;
                    return;
                }
                _ = ticker.tick() => {}
                () = self.flush_notify.notified() => {}
            }

            if !self.is_ready() {
                continue;
            }

            match self.flush_once().await {
                FlushOutcome::Ok => consecutive_failures = 0,
                FlushOutcome::Retryable => {
                    consecutive_failures += 1;
                    let backoff = Self::backoff_for(self.config.flush_interval, consecutive_failures);
                    tokio::select! {
                        () = cancel.cancelled() => {
                            self.drain_until_empty_or_deadline(shutdown_deadline).await;
                            return;
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
                FlushOutcome::ConnectionLost => {
                    consecutive_failures += 1;
                    let mut plugin = self.plugin.lock().await;
                    if let Err(e) = plugin.close().await {
                        tracing::warn!(error = %e, "sink_runner.close_failed");
                    }
                    drop(plugin);
                    if !self.connect_with_backoff(&cancel).await {
                        return;
                    }
                }
            }
        }
    }

    /// Attempt `connect`, retrying with capped exponential backoff and
    /// jitter until it succeeds or `cancel` fires. Returns `false` if
    /// cancelled first.
    async fn connect_with_backoff(&self, cancel: &CancellationToken) -> bool {
        let mut consecutive_failures: u32 = 0;
        loop {
            if let Some(refresh) = &self.credential_refresh {
                let fresh = refresh();
                if let Err(e) = self.plugin.lock().await.reconfigure(&fresh).await {
                    tracing::warn!(error = %e, "sink_runner.reconfigure_failed");
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures += 1;
                    let backoff = Self::backoff_for(self.config.flush_interval, consecutive_failures);
                    tokio::select! {
                        () = cancel.cancelled() => return false,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
            }

            let attempt = self.plugin.lock().await.connect();
            tokio::select! {
                () = cancel.cancelled() => return false,
                result = attempt => match result {
                    Ok(()) => return true,
                    Err(e) => {
                        tracing::warn!(error = %e, "sink_runner.connect_failed");
                        self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                        consecutive_failures += 1;
                        let backoff = Self::backoff_for(self.config.flush_interval, consecutive_failures);
                        tokio::select! {
                            () = cancel.cancelled() => return false,
                            () = tokio::time::sleep(backoff) => {}
                        }
                    }
                },
            }
        }
    }

    /// Drain and flush until the buffer empties or `deadline` elapses.
    async fn drain_until_empty_or_deadline(&self, deadline: Duration) {
        let start = tokio::time::Instant::now();
        while !self.buffer.is_empty() {
            if start.elapsed() >= deadline {
                tracing::warn!(remaining = self.buffer.len(), "sink_runner.shutdown_deadline_exceeded");
                break;
            }
            if matches!(self.flush_once().await, FlushOutcome::ConnectionLost) {
                let mut plugin = self.plugin.lock().await;
                let _ = plugin.close().await;
                drop(plugin);
                if self.plugin.lock().await.connect().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Drain one batch and attempt to write it. A fully empty batch is a
    /// no-op success (nothing to flush this tick).
    async fn flush_once(&self) -> FlushOutcome {
        let handle = self.buffer.drain(self.config.metric_batch_size);
        if handle.is_empty() {
            return FlushOutcome::Ok;
        }
        let mut plugin = self.plugin.lock().await;
        match tokio::time::timeout(self.config.flush_timeout, plugin.write(handle.batch())).await {
            Ok(Ok(())) => {
                handle.commit();
                FlushOutcome::Ok
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sink_runner.write_failed");
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                let lost = e.is_connection_lost();
                handle.reject();
                if lost { FlushOutcome::ConnectionLost } else { FlushOutcome::Retryable }
            }
            Err(_elapsed) => {
                tracing::warn!(timeout = ?self.config.flush_timeout, "sink_runner.flush_timeout");
                self.stats.flush_timeouts.fetch_add(1, Ordering::Relaxed);
                handle.reject();
                FlushOutcome::Retryable
            }
        }
    }

    /// Capped exponential backoff with +/-20% jitter. Doubles per
    /// consecutive failure, capped at 60x `base`.
    fn backoff_for(base: Duration, consecutive_failures: u32) -> Duration {
        let cap = base.saturating_mul(60);
        let exp = consecutive_failures.saturating_sub(1).min(20);
        let multiplier = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        let scaled = base.saturating_mul(multiplier).min(cap);
        let jitter_factor = rand::rng().random_range(0.8..=1.2);
        Duration::from_secs_f64(scaled.as_secs_f64() * jitter_factor)
    }
}

impl std::fmt::Debug for SinkRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRunner")
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use domain::{FieldValue, MeasurementKind, Timestamp};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU64;

    /// Shared observation point for a test sink. Plain data only -- the
    /// `SinkPlugin` impl lives on [`RecordingSinkHandle`], since `connect`/
    /// `write` need `&mut self` while tests need to keep observing the same
    /// sink state after handing a plugin to the runner.
    struct RecordingSink {
        connects: AtomicU64,
        batches: Mutex<Vec<Vec<Measurement>>>,
        fail_next_write: AtomicBool,
        lose_connection_next_write: AtomicBool,
        reconfigured_with: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                connects: AtomicU64::new(0),
                batches: Mutex::new(Vec::new()),
                fail_next_write: AtomicBool::new(false),
                lose_connection_next_write: AtomicBool::new(false),
                reconfigured_with: Mutex::new(Vec::new()),
            }
        }
    }

    struct RecordingSinkHandle(Arc<RecordingSink>);

    #[async_trait]
    impl domain::SinkPlugin for RecordingSinkHandle {
        fn sample_config(&self) -> &'static str {
            "# recording sink, no config"
        }

        async fn connect(&mut self) -> Result<(), PluginError> {
            self.0.connects.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn write(&mut self, batch: &[Measurement]) -> Result<(), PluginError> {
            if self.0.lose_connection_next_write.swap(false, Ordering::Relaxed) {
                return Err(PluginError::new("connection dropped").connection_lost());
            }
            if self.0.fail_next_write.swap(false, Ordering::Relaxed) {
                return Err(PluginError::new("write rejected"));
            }
            self.0.batches.lock().await.push(batch.to_vec());
            Ok(())
        }

        async fn reconfigure(&mut self, config: &str) -> Result<(), PluginError> {
            self.0.reconfigured_with.lock().await.push(config.to_owned());
            Ok(())
        }
    }

    struct HangingSink;

    #[async_trait]
    impl domain::SinkPlugin for HangingSink {
        fn sample_config(&self) -> &'static str {
            "# hanging sink, no config"
        }

        async fn connect(&mut self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn write(&mut self, _batch: &[Measurement]) -> Result<(), PluginError> {
            std::future::pending().await
        }
    }

    fn measurement(name: &str) -> Measurement {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_owned(), FieldValue::Int64(1));
        Measurement::new(name, BTreeMap::new(), fields, Timestamp::now(), MeasurementKind::Gauge).unwrap()
    }

    fn config(flush_interval_ms: u64, batch_size: usize) -> SinkRunnerConfig {
        SinkRunnerConfig::builder(Duration::from_millis(flush_interval_ms), 100)
            .metric_batch_size(batch_size)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn size_triggered_flush_does_not_wait_for_tick() {
        let sink = Arc::new(RecordingSink::new());
        let runner = SinkRunner::new(Box::new(RecordingSinkHandle(Arc::clone(&sink))), config(10_000, 2));
        let tx = runner.spawn_ingest(10);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(run_cancel, Duration::from_secs(1)).await });

        tx.send(measurement("a")).await.unwrap();
        tx.send(measurement("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.batches.lock().await.len(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_closes_and_reconnects_before_next_attempt() {
        let sink = Arc::new(RecordingSink::new());
        sink.lose_connection_next_write.store(true, Ordering::Relaxed);
        let runner = SinkRunner::new(Box::new(RecordingSinkHandle(Arc::clone(&sink))), config(20, 1));
        let tx = runner.spawn_ingest(10);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(run_cancel, Duration::from_secs(1)).await });

        tx.send(measurement("a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(sink.connects.load(Ordering::Relaxed) >= 2);
        assert_eq!(sink.batches.lock().await.len(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gated_sink_buffers_but_does_not_flush_until_marked_ready() {
        let sink = Arc::new(RecordingSink::new());
        let cfg = SinkRunnerConfig::builder(Duration::from_millis(10), 100)
            .metric_batch_size(1)
            .startup_gated(true)
            .build()
            .unwrap();
        let runner = SinkRunner::new(Box::new(RecordingSinkHandle(Arc::clone(&sink))), cfg);
        let tx = runner.spawn_ingest(10);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_handle = Arc::clone(&runner);
        let handle = tokio::spawn(async move { run_handle.run(run_cancel, Duration::from_secs(1)).await });

        tx.send(measurement("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.batches.lock().await.is_empty());

        runner.mark_ready();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.batches.lock().await.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_remaining_buffer_before_returning() {
        let sink = Arc::new(RecordingSink::new());
        let runner = SinkRunner::new(Box::new(RecordingSinkHandle(Arc::clone(&sink))), config(10_000, 10));
        let tx = runner.spawn_ingest(10);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_handle = Arc::clone(&runner);
        let handle = tokio::spawn(async move { run_handle.run(run_cancel, Duration::from_secs(5)).await });

        tx.send(measurement("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.batches.lock().await.len(), 1);
        assert!(runner.buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_is_counted_as_flush_timeout() {
        let cfg = SinkRunnerConfig::builder(Duration::from_millis(10_000), 100)
            .metric_batch_size(1)
            .flush_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let runner = SinkRunner::new(Box::new(HangingSink), cfg);
        let tx = runner.spawn_ingest(10);
        let stats = runner.stats();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_handle = Arc::clone(&runner);
        let handle = tokio::spawn(async move { run_handle.run(run_cancel, Duration::from_millis(10)).await });

        tx.send(measurement("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(stats.flush_timeouts.load(Ordering::Relaxed) >= 1);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_counters_reflect_committed_and_held() {
        let sink = Arc::new(RecordingSink::new());
        let runner = SinkRunner::new(Box::new(RecordingSinkHandle(Arc::clone(&sink))), config(10_000, 1));
        let tx = runner.spawn_ingest(10);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_handle = Arc::clone(&runner);
        let handle = tokio::spawn(async move { run_handle.run(run_cancel, Duration::from_secs(1)).await });

        tx.send(measurement("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let counters = runner.buffer_counters();
        assert_eq!(counters.committed, 1);
        assert_eq!(counters.held, 0);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn credential_refresh_reconfigures_plugin_before_each_connect() {
        let sink = Arc::new(RecordingSink::new());
        let calls = Arc::new(AtomicU64::new(0));
        let refresh_calls = Arc::clone(&calls);
        let runner = SinkRunner::new_with_credential_refresh(
            Box::new(RecordingSinkHandle(Arc::clone(&sink))),
            config(10_000, 2),
            Some(Box::new(move || {
                let n = refresh_calls.fetch_add(1, Ordering::Relaxed);
                format!("token-{n}")
            })),
        );
        let cancel = CancellationToken::new();
        assert!(runner.connect_with_backoff(&cancel).await);

        assert_eq!(sink.reconfigured_with.lock().await.as_slice(), ["token-0"]);
        assert_eq!(sink.connects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let base = Duration::from_secs(1);
        let first = SinkRunner::backoff_for(base, 1);
        let tenth = SinkRunner::backoff_for(base, 10);
        let capped = SinkRunner::backoff_for(base, 100);
        assert!(first <= Duration::from_millis(1_200));
        assert!(tenth > first);
        assert!(capped <= base.saturating_mul(60) + Duration::from_secs(1));
    }
}
