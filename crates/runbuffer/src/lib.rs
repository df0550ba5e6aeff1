//! Bounded FIFO of measurements sitting between a collector's emit rate and a
//! sink's flush rate (§4.2). Drop-oldest-on-overflow on the write side,
//! reject-reinserts-at-head on the read side, so a sink outage degrades to
//! bounded data loss rather than unbounded memory growth.
//!
//! Concurrency: any number of producers may call [`RunningBuffer::add`] /
//! [`RunningBuffer::add_batch`] concurrently -- the inner `parking_lot::Mutex`
//! serializes them. The design assumes at most one outstanding
//! [`DrainHandle`] at a time (one sink runner owns one buffer); nothing here
//! corrupts state if that's violated, but counters and ordering are only
//! meaningful for the intended single-drainer usage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use domain::Measurement;
use parking_lot::Mutex;

/// One buffered measurement plus the monotonic index it was admitted under.
/// The index is used only to preserve FIFO order across `reject`
/// reinsertion; it is never exposed outside this crate.
#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    measurement: Measurement,
}

struct Inner {
    entries: VecDeque<Entry>,
    capacity: usize,
}

/// A bounded FIFO of measurements owned by exactly one sink runner.
#[derive(Debug)]
pub struct RunningBuffer {
    inner: Mutex<Inner>,
    next_seq: AtomicU64,
    produced: AtomicU64,
    committed: AtomicU64,
    dropped: AtomicU64,
}

impl RunningBuffer {
    /// Create an empty buffer holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
            }),
            next_seq: AtomicU64::new(0),
            produced: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Admit `m`, dropping the oldest entry first if the buffer is full.
    pub fn add(&self, m: Measurement) {
        let mut inner = self.inner.lock();
        Self::admit_locked(&mut inner, &self.dropped, m);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        inner.entries.back_mut().expect("just pushed").seq = seq;
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    /// Admit `ms` in order, applying the same drop-oldest policy per item.
    pub fn add_batch(&self, ms: impl IntoIterator<Item = Measurement>) {
        let mut inner = self.inner.lock();
        let mut count = 0u64;
        for m in ms {
            Self::admit_locked(&mut inner, &self.dropped, m);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            inner.entries.back_mut().expect("just pushed").seq = seq;
            count += 1;
        }
        self.produced.fetch_add(count, Ordering::Relaxed);
    }

    /// Push `m` onto the back, evicting the front if at capacity. Caller
    /// fixes up `seq` afterward (kept separate so `add_batch` can hold the
    /// lock across the whole batch without double-incrementing `next_seq`
    /// mid-push).
    fn admit_locked(inner: &mut Inner, dropped: &AtomicU64, m: Measurement) {
        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
            dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.entries.push_back(Entry { seq: 0, measurement: m });
    }

    /// Atomically remove up to `n` oldest entries and hand them to the
    /// caller as a [`DrainHandle`]. The entries remain logically "held" by
    /// the buffer (counted in `produced - committed - dropped`) until the
    /// handle is resolved via [`DrainHandle::commit`] or
    /// [`DrainHandle::reject`].
    pub fn drain(&self, n: usize) -> DrainHandle<'_> {
        let mut inner = self.inner.lock();
        let count = n.min(inner.entries.len());
        let taken: Vec<Entry> = inner.entries.drain(..count).collect();
        DrainHandle {
            buffer: self,
            seqs: taken.iter().map(|e| e.seq).collect(),
            measurements: taken.into_iter().map(|e| e.measurement).collect(),
            settled: false,
        }
    }

    /// Total measurements ever admitted (including those later dropped).
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Total measurements permanently committed (accepted by the sink).
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Total measurements permanently dropped (overflow or reject-overflow).
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of entries currently sitting in the buffer (excludes anything
    /// held by an outstanding [`DrainHandle`]).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the buffer currently holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A batch of entries removed from a [`RunningBuffer`] by [`RunningBuffer::drain`].
///
/// Move-only by construction (no `Clone`/`Copy`): [`DrainHandle::commit`] and
/// [`DrainHandle::reject`] both take `self` by value, so the type system
/// rules out calling either one twice on the same batch -- a stricter but
/// still-conformant reading of "calling reject twice is an error". Dropping
/// a handle without resolving it (e.g. on an early return) falls back to
/// `reject` semantics so held entries are never silently lost.
#[derive(Debug)]
pub struct DrainHandle<'a> {
    buffer: &'a RunningBuffer,
    seqs: Vec<u64>,
    measurements: Vec<Measurement>,
    settled: bool,
}

impl DrainHandle<'_> {
    /// The drained measurements, in insertion order.
    #[must_use]
    pub fn batch(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Number of measurements in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Whether this batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Permanently drop this batch: the sink accepted it.
    pub fn commit(mut self) {
        self.settled = true;
        self.buffer
            .committed
            .fetch_add(self.measurements.len() as u64, Ordering::Relaxed);
    }

    /// Reinsert this batch at the head of the buffer, preserving order. If
    /// reinsertion would exceed capacity, the newest post-batch entries are
    /// dropped first so the batch's own contents are always preserved.
    pub fn reject(mut self) {
        self.settled = true;
        self.reinsert();
    }

    fn reinsert(&mut self) {
        if self.measurements.is_empty() {
            return;
        }
        let mut inner = self.buffer.inner.lock();
        let batch_entries = std::mem::take(&mut self.seqs)
            .into_iter()
            .zip(std::mem::take(&mut self.measurements))
            .map(|(seq, measurement)| Entry { seq, measurement });
        let mut combined: VecDeque<Entry> = batch_entries.collect();
        combined.extend(inner.entries.drain(..));
        let mut dropped = 0u64;
        while combined.len() > inner.capacity {
            combined.pop_back();
            dropped += 1;
        }
        inner.entries = combined;
        if dropped > 0 {
            self.buffer.dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(dropped, "runbuffer.reject_overflow");
        }
    }
}

impl Drop for DrainHandle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("runbuffer.drain_handle_dropped_unresolved");
            self.reinsert();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn m(name: &str) -> Measurement {
        let mut fields = BTreeMap::new();
        fields.insert("v".to_owned(), domain::FieldValue::Int64(1));
        Measurement::new(
            name,
            BTreeMap::new(),
            fields,
            domain::Timestamp::now(),
            domain::MeasurementKind::Gauge,
        )
        .unwrap()
    }

    #[test]
    fn add_then_drain_preserves_order() {
        let buf = RunningBuffer::new(10);
        buf.add(m("a"));
        buf.add(m("b"));
        buf.add(m("c"));
        let handle = buf.drain(10);
        let names: Vec<_> = handle.batch().iter().map(domain::Measurement::name).collect();
        assert_eq!(names, ["a", "b", "c"]);
        handle.commit();
        assert_eq!(buf.committed(), 3);
        assert_eq!(buf.produced(), 3);
        assert_eq!(buf.dropped(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts_it() {
        let buf = RunningBuffer::new(2);
        buf.add(m("a"));
        buf.add(m("b"));
        buf.add(m("c")); // evicts "a"
        assert_eq!(buf.dropped(), 1);
        let handle = buf.drain(10);
        let names: Vec<_> = handle.batch().iter().map(domain::Measurement::name).collect();
        assert_eq!(names, ["b", "c"]);
        handle.commit();
    }

    #[test]
    fn reject_reinserts_at_head_preserving_order() {
        let buf = RunningBuffer::new(10);
        buf.add(m("a"));
        buf.add(m("b"));
        let handle = buf.drain(1); // takes "a"
        buf.add(m("c")); // buffer now holds "b", "c"
        handle.reject(); // "a" goes back to the head
        let final_handle = buf.drain(10);
        let names: Vec<_> = final_handle.batch().iter().map(domain::Measurement::name).collect();
        assert_eq!(names, ["a", "b", "c"]);
        final_handle.commit();
    }

    #[test]
    fn reject_overflow_drops_newest_preserving_batch() {
        let buf = RunningBuffer::new(2);
        buf.add(m("a"));
        let handle = buf.drain(1); // takes "a", buffer empty
        buf.add(m("b"));
        buf.add(m("c")); // buffer full at capacity 2: "b", "c"
        handle.reject(); // reinsert "a" at head -> ["a", "b", "c"], over capacity by 1
        assert_eq!(buf.dropped(), 1);
        let final_handle = buf.drain(10);
        let names: Vec<_> = final_handle.batch().iter().map(domain::Measurement::name).collect();
        assert_eq!(names, ["a", "b"]); // "c" (newest) dropped, batch preserved
        final_handle.commit();
    }

    #[test]
    fn produced_equals_committed_plus_dropped_plus_held_at_quiescence() {
        let buf = RunningBuffer::new(3);
        buf.add(m("a"));
        buf.add(m("b"));
        buf.add(m("c"));
        buf.add(m("d")); // drops "a"
        let handle = buf.drain(2);
        handle.commit();
        let held = buf.len() as u64;
        assert_eq!(buf.produced(), buf.committed() + buf.dropped() + held);
    }

    #[test]
    fn dropping_unresolved_handle_falls_back_to_reject() {
        let buf = RunningBuffer::new(10);
        buf.add(m("a"));
        {
            let _handle = buf.drain(10);
            // handle dropped here without commit/reject
        }
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.committed(), 0);
    }

    #[test]
    fn drain_more_than_available_takes_all() {
        let buf = RunningBuffer::new(10);
        buf.add(m("a"));
        let handle = buf.drain(100);
        assert_eq!(handle.len(), 1);
        handle.commit();
    }
}
