//! The universal datum passed between every component of the pipeline.
//!
//! A [`Measurement`] is name + tags + fields + timestamp + [`MeasurementKind`]
//! hint. The core never reinterprets a value based on `kind` -- it is carried
//! end-to-end for whatever sink eventually consumes it.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Reserved tag/field key prefix the core refuses to let plugins set directly.
///
/// Mirrors the "reserved names defined by the configuration collaborator"
/// clause in the data model: the core itself reserves one namespace so the
/// self-monitoring collector can attach diagnostic tags without collision.
pub const RESERVED_KEY_PREFIX: &str = "agent_internal_";

/// Errors raised while constructing or mutating a [`Measurement`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeasurementError {
    /// `name` was empty.
    #[error("measurement name must not be empty")]
    EmptyName,
    /// A measurement with zero fields was rejected at construction.
    #[error("measurement must carry at least one field")]
    EmptyFields,
    /// A tag or field key was empty, or collided with the reserved prefix.
    #[error("key {key:?} is empty or reserved")]
    InvalidKey {
        /// The offending key.
        key: String,
    },
    /// A field value failed validation (NaN, +-Inf, or non-UTF-8 source bytes).
    #[error("field {key:?} has an invalid value: {reason}")]
    InvalidFieldValue {
        /// The field key that was rejected.
        key: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Tagged variant for field values. No silent coercion happens inside the
/// core: a collector or parser declares intent by constructing the right
/// variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// 64-bit float. Must be finite -- see [`FieldValue::validate`].
    Float64(f64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
}

impl FieldValue {
    /// Reject non-finite floats. Other variants are always valid.
    fn validate(&self) -> Result<(), String> {
        match self {
            FieldValue::Float64(f) if !f.is_finite() => {
                Err(format!("float field value {f} is not finite"))
            }
            _ => Ok(()),
        }
    }
}

/// Hint carried end-to-end; the core never reinterprets values based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementKind {
    /// No particular shape implied.
    Untyped,
    /// Monotonically increasing value.
    Counter,
    /// Point-in-time value that can go up or down.
    Gauge,
    /// Pre-aggregated quantile summary.
    Summary,
    /// Pre-aggregated bucketed distribution.
    Histogram,
}

/// Instant with nanosecond resolution.
///
/// Wraps [`SystemTime`] rather than re-deriving a clock abstraction; exposes
/// a `chrono` accessor for display and serialization, matching the teacher
/// workspace's existing `chrono` dependency for anything calendar-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Wrap the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Wrap an explicit [`SystemTime`].
    #[must_use]
    pub fn from_system_time(t: SystemTime) -> Self {
        Self(t)
    }

    /// Borrow the underlying [`SystemTime`].
    #[must_use]
    pub fn as_system_time(&self) -> SystemTime {
        self.0
    }

    /// Round down to the nearest multiple of `precision`.
    ///
    /// Used by the collector runner to stamp tick time at a configured
    /// precision (e.g. whole seconds) per the per-tick algorithm in §4.4.
    #[must_use]
    pub fn rounded_to(&self, precision: std::time::Duration) -> Self {
        if precision.is_zero() {
            return *self;
        }
        let since_epoch = self
            .0
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let precision_nanos = precision.as_nanos().max(1);
        let nanos = since_epoch.as_nanos();
        let rounded = (nanos / precision_nanos) * precision_nanos;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "rounded is always <= nanos, which already fit in u64 range for any realistic timestamp"
        )]
        let rounded_u64 = rounded as u64;
        Self(SystemTime::UNIX_EPOCH + std::time::Duration::from_nanos(rounded_u64))
    }

    /// Render as an RFC 3339 string via `chrono`, for logging/serialization.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        chrono::DateTime::<chrono::Utc>::from(self.0).to_rfc3339()
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

/// A single observation: name, tag set, field set, timestamp, kind hint.
///
/// Constructed via [`Measurement::new`]; mutated only through the explicit
/// accessors below until it enters fan-out, after which each sink owns an
/// independent copy (see module docs and spec §3 lifecycle note).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Timestamp,
    kind: MeasurementKind,
}

fn validate_key(key: &str) -> Result<(), MeasurementError> {
    if key.is_empty() || key.starts_with(RESERVED_KEY_PREFIX) {
        return Err(MeasurementError::InvalidKey {
            key: key.to_owned(),
        });
    }
    Ok(())
}

impl Measurement {
    /// Construct a new measurement.
    ///
    /// # Errors
    ///
    /// Returns [`MeasurementError::EmptyName`] if `name` is empty,
    /// [`MeasurementError::EmptyFields`] if `fields` is empty,
    /// [`MeasurementError::InvalidKey`] for an empty/reserved tag or field
    /// key, or [`MeasurementError::InvalidFieldValue`] for a non-finite float.
    pub fn new(
        name: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        timestamp: Timestamp,
        kind: MeasurementKind,
    ) -> Result<Self, MeasurementError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MeasurementError::EmptyName);
        }
        if fields.is_empty() {
            return Err(MeasurementError::EmptyFields);
        }
        for key in tags.keys() {
            validate_key(key)?;
        }
        for (key, value) in &fields {
            validate_key(key)?;
            value
                .validate()
                .map_err(|reason| MeasurementError::InvalidFieldValue {
                    key: key.clone(),
                    reason,
                })?;
        }
        Ok(Self {
            name,
            tags,
            fields,
            timestamp,
            kind,
        })
    }

    /// Measurement name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read-only view of the tag set.
    #[must_use]
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Read-only view of the field set.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Current timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Current kind hint.
    #[must_use]
    pub fn kind(&self) -> MeasurementKind {
        self.kind
    }

    /// Replace the name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Replace the timestamp.
    pub fn set_time(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    /// Stamp the timestamp only if it has not already been set explicitly by
    /// the caller -- used by the collector runner accumulator, which only
    /// fills in a missing time (§4.4 step 2).
    pub fn stamp_time_if_unset(&mut self, timestamp: Timestamp, was_unset: bool) {
        if was_unset {
            self.timestamp = timestamp;
        }
    }

    /// Insert or replace a tag.
    ///
    /// # Errors
    ///
    /// Returns [`MeasurementError::InvalidKey`] for an empty or reserved key.
    /// On error the measurement is left unchanged.
    pub fn add_tag(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MeasurementError> {
        let key = key.into();
        validate_key(&key)?;
        self.tags.insert(key, value.into());
        Ok(())
    }

    /// Remove a tag if present.
    pub fn remove_tag(&mut self, key: &str) {
        self.tags.remove(key);
    }

    /// Insert or replace a field, rejecting an invalid value.
    ///
    /// Setting a field that already exists replaces the prior value.
    /// Attempting to add an invalid value (non-finite float) fails and
    /// leaves the measurement unchanged, per the "Overflow" rule in §4.1.
    ///
    /// # Errors
    ///
    /// Returns [`MeasurementError::InvalidKey`] or
    /// [`MeasurementError::InvalidFieldValue`]; the measurement is unchanged
    /// in either case.
    pub fn add_field(
        &mut self,
        key: impl Into<String>,
        value: FieldValue,
    ) -> Result<(), MeasurementError> {
        let key = key.into();
        validate_key(&key)?;
        value
            .validate()
            .map_err(|reason| MeasurementError::InvalidFieldValue {
                key: key.clone(),
                reason,
            })?;
        self.fields.insert(key, value);
        Ok(())
    }

    /// Remove a field if present. Does not enforce the "at least one field"
    /// invariant -- that is only checked at construction time.
    pub fn remove_field(&mut self, key: &str) {
        self.fields.remove(key);
    }

    /// Stable 64-bit digest over `name` and the lexicographically sorted tag
    /// pairs. MUST NOT depend on fields, timestamp, or kind (§4.1).
    ///
    /// Implemented as FNV-1a over a canonical byte encoding rather than a
    /// seeded hasher (`RandomState`/`ahash`), because the spec requires the
    /// digest to be identical "across processes and versions" -- a property
    /// a per-process-seeded hash cannot provide.
    #[must_use]
    pub fn hash_identity(&self) -> u64 {
        const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET_BASIS;
        let mut feed = |bytes: &[u8]| {
            for &byte in bytes {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };

        feed(self.name.as_bytes());
        feed(&[0u8]); // separator, so "ab"+"c" != "a"+"bc"
        // BTreeMap already yields keys in lexicographic order.
        for (key, value) in &self.tags {
            feed(key.as_bytes());
            feed(&[0u8]);
            feed(value.as_bytes());
            feed(&[0u8]);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn fields(pairs: Vec<(&str, FieldValue)>) -> BTreeMap<String, FieldValue> {
        pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    #[test]
    fn empty_name_rejected() {
        let result = Measurement::new(
            "",
            BTreeMap::new(),
            fields(vec![("x", FieldValue::Int64(1))]),
            Timestamp::now(),
            MeasurementKind::Untyped,
        );
        assert_eq!(result.unwrap_err(), MeasurementError::EmptyName);
    }

    #[test]
    fn empty_fields_rejected() {
        let result = Measurement::new(
            "cpu",
            BTreeMap::new(),
            BTreeMap::new(),
            Timestamp::now(),
            MeasurementKind::Gauge,
        );
        assert_eq!(result.unwrap_err(), MeasurementError::EmptyFields);
    }

    #[test]
    fn reserved_tag_key_rejected() {
        let result = Measurement::new(
            "cpu",
            tags(&[("agent_internal_x", "1")]),
            fields(vec![("x", FieldValue::Int64(1))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        );
        assert!(matches!(result, Err(MeasurementError::InvalidKey { .. })));
    }

    #[test]
    fn nan_field_rejected_at_construction() {
        let result = Measurement::new(
            "cpu",
            BTreeMap::new(),
            fields(vec![("x", FieldValue::Float64(f64::NAN))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        );
        assert!(matches!(
            result,
            Err(MeasurementError::InvalidFieldValue { .. })
        ));
    }

    #[test]
    fn add_field_replaces_existing_value() {
        let mut m = Measurement::new(
            "cpu",
            BTreeMap::new(),
            fields(vec![("x", FieldValue::Int64(1))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        )
        .unwrap();
        m.add_field("x", FieldValue::Int64(2)).unwrap();
        assert_eq!(m.fields().get("x"), Some(&FieldValue::Int64(2)));
    }

    #[test]
    fn add_invalid_field_leaves_measurement_unchanged() {
        let mut m = Measurement::new(
            "cpu",
            BTreeMap::new(),
            fields(vec![("x", FieldValue::Int64(1))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        )
        .unwrap();
        let before = m.clone();
        let result = m.add_field("x", FieldValue::Float64(f64::INFINITY));
        assert!(result.is_err());
        assert_eq!(m, before);
    }

    #[test]
    fn hash_identity_ignores_fields_timestamp_kind() {
        let a = Measurement::new(
            "cpu",
            tags(&[("host", "h1")]),
            fields(vec![("user", FieldValue::Float64(0.1))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        )
        .unwrap();
        let mut b = a.clone();
        b.add_field("user", FieldValue::Float64(0.9)).unwrap();
        b.set_time(Timestamp::from_system_time(
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1),
        ));
        assert_eq!(a.hash_identity(), b.hash_identity());
    }

    #[test]
    fn hash_identity_differs_on_tags() {
        let a = Measurement::new(
            "cpu",
            tags(&[("host", "h1")]),
            fields(vec![("user", FieldValue::Float64(0.1))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        )
        .unwrap();
        let b = Measurement::new(
            "cpu",
            tags(&[("host", "h2")]),
            fields(vec![("user", FieldValue::Float64(0.1))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        )
        .unwrap();
        assert_ne!(a.hash_identity(), b.hash_identity());
    }

    #[test]
    fn hash_identity_is_order_independent_on_insertion() {
        // BTreeMap already sorts on insert regardless of insertion order;
        // this asserts the invariant holds for the constructed type too.
        let a = Measurement::new(
            "cpu",
            tags(&[("a", "1"), ("b", "2")]),
            fields(vec![("x", FieldValue::Int64(1))]),
            Timestamp::now(),
            MeasurementKind::Untyped,
        )
        .unwrap();
        let b = Measurement::new(
            "cpu",
            tags(&[("b", "2"), ("a", "1")]),
            fields(vec![("x", FieldValue::Int64(1))]),
            Timestamp::now(),
            MeasurementKind::Untyped,
        )
        .unwrap();
        assert_eq!(a.hash_identity(), b.hash_identity());
    }

    #[test]
    fn copy_is_independent() {
        let a = Measurement::new(
            "cpu",
            BTreeMap::new(),
            fields(vec![("x", FieldValue::Int64(1))]),
            Timestamp::now(),
            MeasurementKind::Gauge,
        )
        .unwrap();
        let mut b = a.clone();
        b.add_field("x", FieldValue::Int64(99)).unwrap();
        assert_eq!(a.fields().get("x"), Some(&FieldValue::Int64(1)));
        assert_eq!(b.fields().get("x"), Some(&FieldValue::Int64(99)));
    }

    #[test]
    fn rounded_to_truncates_to_precision() {
        let t = Timestamp::from_system_time(
            SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1_234),
        );
        let rounded = t.rounded_to(std::time::Duration::from_secs(1));
        assert_eq!(
            rounded.as_system_time(),
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1)
        );
    }
}
