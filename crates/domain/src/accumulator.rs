//! The capability set plugins use to emit measurements and report errors.
//!
//! Concrete implementations differ between `test()` (prints), `run_once()`
//! and `run()` (real sinks via a runner-owned accumulator), and tracking mode
//! (delivery acknowledgement for push-style collectors) -- all sharing this
//! one contract, per Design Notes §9 "Accumulator polymorphism".

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::PluginError;
use crate::measurement::{FieldValue, MeasurementKind, Timestamp};

/// Capability set exposed to collector (and aggregator `push`) plugins.
///
/// Object-safe by construction: no generic method parameters, so runners can
/// hold `&dyn Accumulator` / `Arc<dyn Accumulator>` despite plugins being of
/// heterogeneous concrete types.
pub trait Accumulator: Send + Sync {
    /// Accept one measurement with an explicit kind. `time: None` means "the
    /// runner should stamp the tick time" -- the concrete accumulator (owned
    /// by the collector/sink runner) is responsible for that stamping, tag
    /// injection, filtering, and fan-out; this trait only describes intent.
    fn add_measurement(
        &self,
        kind: MeasurementKind,
        name: &str,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Option<Timestamp>,
    );

    /// Record a non-fatal plugin error (§7 `CollectError`/similar).
    fn add_error(&self, err: PluginError);

    /// Convenience: add an untyped measurement.
    fn add_fields(
        &self,
        name: &str,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
        time: Option<Timestamp>,
    ) {
        self.add_measurement(MeasurementKind::Untyped, name, tags, fields, time);
    }

    /// Convenience: add a gauge measurement.
    fn add_gauge(
        &self,
        name: &str,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
        time: Option<Timestamp>,
    ) {
        self.add_measurement(MeasurementKind::Gauge, name, tags, fields, time);
    }

    /// Convenience: add a counter measurement.
    fn add_counter(
        &self,
        name: &str,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
        time: Option<Timestamp>,
    ) {
        self.add_measurement(MeasurementKind::Counter, name, tags, fields, time);
    }

    /// Convenience: add a histogram measurement.
    fn add_histogram(
        &self,
        name: &str,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
        time: Option<Timestamp>,
    ) {
        self.add_measurement(MeasurementKind::Histogram, name, tags, fields, time);
    }

    /// Convenience: add a summary measurement.
    fn add_summary(
        &self,
        name: &str,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
        time: Option<Timestamp>,
    ) {
        self.add_measurement(MeasurementKind::Summary, name, tags, fields, time);
    }
}

/// Minimal in-memory [`Accumulator`]: collects everything into a `Mutex`-ed
/// `Vec`. Backs `Agent::test()`'s built-in "print" sink and unit tests for
/// collector plugins that don't need a full runner.
#[derive(Debug, Default)]
pub struct VecAccumulator {
    measurements: Mutex<Vec<crate::measurement::Measurement>>,
    errors: Mutex<Vec<PluginError>>,
}

impl VecAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain all accepted measurements in insertion order.
    #[must_use]
    pub fn take_measurements(&self) -> Vec<crate::measurement::Measurement> {
        std::mem::take(&mut self.measurements.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Number of errors recorded so far.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

impl Accumulator for VecAccumulator {
    fn add_measurement(
        &self,
        kind: MeasurementKind,
        name: &str,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Option<Timestamp>,
    ) {
        match crate::measurement::Measurement::new(
            name,
            tags,
            fields,
            time.unwrap_or_default(),
            kind,
        ) {
            Ok(m) => self.measurements.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(m),
            Err(e) => self.add_error(PluginError::from_source("invalid measurement", e)),
        }
    }

    fn add_error(&self, err: PluginError) {
        tracing::warn!(error = %err, "accumulator.error");
        self.errors.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(err);
    }
}

/// Wraps a downstream [`Accumulator`] and signals a delivery token every
/// `group_size` accepted measurements, via the paired [`mpsc::Receiver`].
///
/// For push-style collectors that need delivery confirmation (e.g. to ack an
/// upstream message queue) -- see §6 `with_tracking`.
pub struct TrackingAccumulator {
    downstream: std::sync::Arc<dyn Accumulator>,
    group_size: usize,
    delivered: std::sync::atomic::AtomicUsize,
    tokens: mpsc::UnboundedSender<u64>,
}

impl TrackingAccumulator {
    fn new(
        downstream: std::sync::Arc<dyn Accumulator>,
        group_size: usize,
        tokens: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            downstream,
            group_size: group_size.max(1),
            delivered: std::sync::atomic::AtomicUsize::new(0),
            tokens,
        }
    }
}

impl Accumulator for TrackingAccumulator {
    fn add_measurement(
        &self,
        kind: MeasurementKind,
        name: &str,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Option<Timestamp>,
    ) {
        self.downstream.add_measurement(kind, name, tags, fields, time);
        let prior = self
            .delivered
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if prior % self.group_size == 0 {
            // Receiver side decides what to do with the token (e.g. ack);
            // dropping it here if there is no receiver is not an error.
            #[expect(clippy::cast_possible_truncation, reason = "group count fits u64 for any realistic run")]
            let token = (prior / self.group_size) as u64;
            let _ = self.tokens.send(token);
        }
    }

    fn add_error(&self, err: PluginError) {
        self.downstream.add_error(err);
    }
}

/// Build a [`TrackingAccumulator`] wrapping `downstream`, plus a receiver
/// that yields one token per `group_size` measurements delivered through it.
#[must_use]
pub fn with_tracking(
    group_size: usize,
    downstream: std::sync::Arc<dyn Accumulator>,
) -> (TrackingAccumulator, mpsc::UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TrackingAccumulator::new(downstream, group_size, tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_fields() -> BTreeMap<String, FieldValue> {
        [("x".to_owned(), FieldValue::Int64(1))].into_iter().collect()
    }

    #[test]
    fn vec_accumulator_collects_valid_measurements() {
        let acc = VecAccumulator::new();
        acc.add_gauge("cpu", some_fields(), BTreeMap::new(), None);
        acc.add_counter("reqs", some_fields(), BTreeMap::new(), None);
        let collected = acc.take_measurements();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].kind(), MeasurementKind::Gauge);
        assert_eq!(collected[1].kind(), MeasurementKind::Counter);
    }

    #[test]
    fn vec_accumulator_records_invalid_as_error_not_panic() {
        let acc = VecAccumulator::new();
        acc.add_fields("", some_fields(), BTreeMap::new(), None);
        assert!(acc.take_measurements().is_empty());
        assert_eq!(acc.error_count(), 1);
    }

    #[test]
    fn take_measurements_drains() {
        let acc = VecAccumulator::new();
        acc.add_gauge("cpu", some_fields(), BTreeMap::new(), None);
        assert_eq!(acc.take_measurements().len(), 1);
        assert_eq!(acc.take_measurements().len(), 0);
    }

    #[tokio::test]
    async fn tracking_accumulator_emits_token_per_group() {
        let downstream = std::sync::Arc::new(VecAccumulator::new());
        let (tracking, mut rx) = with_tracking(2, downstream.clone());
        tracking.add_gauge("cpu", some_fields(), BTreeMap::new(), None);
        assert!(rx.try_recv().is_err(), "no token after 1 of 2");
        tracking.add_gauge("cpu", some_fields(), BTreeMap::new(), None);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(downstream.take_measurements().len(), 2);
    }
}
