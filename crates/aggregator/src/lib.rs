//! Windowed accumulation: buffer matching measurements over a period, emit
//! derived measurements at period boundaries, optionally consume the
//! originals (§4.3).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::{AggregatorConfig, AggregatorPlugin, Measurement};
use filterchain::FilterChain;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Wraps one [`AggregatorPlugin`] with its own filter chain and tick
/// schedule. Boxed as `Box<dyn AggregatorPlugin>` inside, since the agent
/// holds a heterogeneous set of aggregator runners side by side.
///
/// `add`/`push`/`reset` all take `&mut self` on the plugin, so the plugin is
/// held behind one `tokio::sync::Mutex`: concurrent `offer` calls from
/// collector runners serialize briefly against each other and against the
/// runner's own tick. This is coarser than "ingress never pauses during
/// push" read literally, but push/reset are expected to be cheap relative to
/// the window period -- a plugin wanting truly lock-free ingress during push
/// would keep its own current/pending split internally.
pub struct AggregatorRunner {
    plugin: Mutex<Box<dyn AggregatorPlugin>>,
    filter: Arc<FilterChain>,
    config: AggregatorConfig,
    busy: AtomicBool,
    pending: AtomicBool,
}

impl AggregatorRunner {
    /// Wrap `plugin` with `config`, compiling its filter chain.
    #[must_use]
    pub fn new(plugin: Box<dyn AggregatorPlugin>, config: AggregatorConfig) -> Self {
        let filter = Arc::new(FilterChain::compile(config.filter.clone()));
        Self {
            plugin: Mutex::new(plugin),
            filter,
            config,
            busy: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }
    }

    /// Whether matched measurements are consumed (not forwarded downstream)
    /// by this aggregator.
    #[must_use]
    pub fn drop_originals(&self) -> bool {
        self.config.drop_originals
    }

    /// Whether `m` falls within this aggregator's filter.
    #[must_use]
    pub fn matches(&self, m: &Measurement) -> bool {
        self.filter.matches(m)
    }

    /// A shared handle to this aggregator's compiled filter, so a collector
    /// runner's fan-out can test `matches` without this aggregator's own
    /// lock or the collector_runner crate depending on this one's internals.
    #[must_use]
    pub fn filter_handle(&self) -> Arc<FilterChain> {
        Arc::clone(&self.filter)
    }

    /// Offer `m` to this aggregator. Call only after [`AggregatorRunner::matches`]
    /// returned `true`.
    pub async fn ingest(&self, m: &Measurement) {
        self.plugin.lock().await.add(m);
    }

    /// Spawn a background task that folds every measurement sent on the
    /// returned channel into this aggregator. Lets a collector runner hand
    /// off matched measurements without awaiting this aggregator's lock
    /// inline in its own fan-out path.
    #[must_use]
    pub fn spawn_feed(self: Arc<Self>, capacity: usize) -> mpsc::Sender<Measurement> {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(m) = rx.recv().await {
                self.ingest(&m).await;
            }
        });
        tx
    }

    /// Force one push-then-reset cycle right now, bypassing the scheduled
    /// tick. Used by `Agent::run_once` (§4.7), which performs a single
    /// collect-then-flush pass rather than running the periodic schedule.
    pub async fn push_once_now(&self, acc: &Arc<dyn domain::Accumulator>) {
        self.push_once(acc).await;
    }

    /// Run the tick loop until `cancel` fires. Per §5 cancellation
    /// semantics: on cancellation, performs one final push if
    /// `drop_originals` is false, so partial-window data is not silently
    /// lost, then returns.
    pub async fn run(&self, acc: Arc<dyn domain::Accumulator>, cancel: CancellationToken) {
        let mut next_tick = self.first_boundary();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if !self.config.drop_originals {
                        self.push_once(&acc).await;
                    }
                    return;
                }
                () = tokio::time::sleep_until(next_tick) => {
                    self.tick(&acc).await;
                    next_tick += self.config.period;
                }
            }
        }
    }

    /// Handle one scheduled tick, coalescing with any tick that arrives
    /// while a push from a prior tick is still in flight. At most one
    /// coalesced tick is remembered -- missed ticks do not accumulate.
    async fn tick(&self, acc: &Arc<dyn domain::Accumulator>) {
        if self.busy.swap(true, Ordering::AcqRel) {
            self.pending.store(true, Ordering::Release);
            return;
        }
        loop {
            self.push_once(acc).await;
            if !self.pending.swap(false, Ordering::AcqRel) {
                break;
            }
        }
        self.busy.store(false, Ordering::Release);
    }

    async fn push_once(&self, acc: &Arc<dyn domain::Accumulator>) {
        let mut plugin = self.plugin.lock().await;
        plugin.push(acc.as_ref()).await;
        plugin.reset();
    }

    /// First tick instant: the next wall-clock multiple of `period`, plus
    /// `delay`.
    fn first_boundary(&self) -> Instant {
        let period = self.config.period.max(Duration::from_nanos(1));
        let now_wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let period_nanos = period.as_nanos().max(1);
        let now_nanos = now_wall.as_nanos();
        let next_boundary_nanos = (now_nanos / period_nanos + 1) * period_nanos;
        let wait_nanos = next_boundary_nanos - now_nanos;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "one period's worth of nanoseconds always fits u64 for any realistic period"
        )]
        let wait = Duration::from_nanos(wait_nanos as u64) + self.config.delay;
        Instant::now() + wait
    }
}
