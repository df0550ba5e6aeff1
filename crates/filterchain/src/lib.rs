//! Per-runner include/exclude predicates over name, tags, and fields, plus
//! optional post-admission tag/field mutations (§4.6).

mod glob;

use domain::{FilterSpec, Measurement};
use glob::Glob;

/// A compiled, reusable set of include/exclude rules plus post-admission
/// mutations. Built once from a [`FilterSpec`] and applied per measurement.
#[derive(Debug)]
pub struct FilterChain {
    name_include: Vec<Glob>,
    name_exclude: Vec<Glob>,
    tag_key_include: Vec<Glob>,
    tag_key_exclude: Vec<Glob>,
    tag_pair_include: Vec<(Glob, Glob)>,
    tag_pair_exclude: Vec<(Glob, Glob)>,
    field_key_include: Vec<Glob>,
    field_key_exclude: Vec<Glob>,
    drop_tags: Vec<String>,
    drop_fields: Vec<String>,
    add_tags: Vec<(String, String)>,
}

impl FilterChain {
    /// Compile a [`FilterSpec`] into an executable chain.
    #[must_use]
    pub fn compile(spec: FilterSpec) -> Self {
        let compile_all = |patterns: Vec<String>| patterns.into_iter().map(Glob::compile).collect();
        let compile_pairs = |pairs: Vec<(String, String)>| {
            pairs
                .into_iter()
                .map(|(k, v)| (Glob::compile(k), Glob::compile(v)))
                .collect()
        };
        Self {
            name_include: compile_all(spec.name_include),
            name_exclude: compile_all(spec.name_exclude),
            tag_key_include: compile_all(spec.tag_key_include),
            tag_key_exclude: compile_all(spec.tag_key_exclude),
            tag_pair_include: compile_pairs(spec.tag_pair_include),
            tag_pair_exclude: compile_pairs(spec.tag_pair_exclude),
            field_key_include: compile_all(spec.field_key_include),
            field_key_exclude: compile_all(spec.field_key_exclude),
            drop_tags: spec.drop_tags,
            drop_fields: spec.drop_fields,
            add_tags: spec.add_tags,
        }
    }

    /// Evaluate and, if admitted, apply this chain's mutations to `m`
    /// in-place. Returns `false` (rejected) without mutating `m` otherwise.
    #[must_use]
    pub fn apply(&self, m: &mut Measurement) -> bool {
        if !self.admits(m) {
            return false;
        }
        for key in &self.drop_tags {
            m.remove_tag(key);
        }
        for key in &self.drop_fields {
            m.remove_field(key);
        }
        for (key, value) in &self.add_tags {
            // Best-effort: an invalid tag key here is a configuration bug,
            // not something a single measurement's filter pass should fail
            // over. `add_tag` already rejects reserved/empty keys silently.
            let _ = m.add_tag(key, value);
        }
        true
    }

    /// Evaluate admission without applying mutations -- for callers (e.g. the
    /// aggregator core) that only need to know whether `m` would be admitted.
    #[must_use]
    pub fn matches(&self, m: &Measurement) -> bool {
        self.admits(m)
    }

    fn admits(&self, m: &Measurement) -> bool {
        Self::dimension_admits(&self.name_include, &self.name_exclude, |g| g.is_match(m.name()))
            && Self::collection_admits(&self.tag_key_include, &self.tag_key_exclude, m.tags().keys().map(String::as_str))
            && Self::pair_collection_admits(&self.tag_pair_include, &self.tag_pair_exclude, m.tags().iter())
            && Self::collection_admits(&self.field_key_include, &self.field_key_exclude, m.fields().keys().map(String::as_str))
    }

    /// A single-valued dimension (name): admitted iff it matches an include
    /// glob (when any are configured) and matches no exclude glob.
    fn dimension_admits(include: &[Glob], exclude: &[Glob], matches: impl Fn(&Glob) -> bool) -> bool {
        if !include.is_empty() && !include.iter().any(&matches) {
            return false;
        }
        if exclude.iter().any(&matches) {
            return false;
        }
        true
    }

    /// A collection-valued dimension (tag keys, field keys): include empty
    /// admits all; non-empty admits iff at least one item in the
    /// measurement's collection matches an include glob. Exclude rejects if
    /// any item matches an exclude glob.
    fn collection_admits<'a>(include: &[Glob], exclude: &[Glob], items: impl Iterator<Item = &'a str> + Clone) -> bool {
        if !include.is_empty() && !items.clone().any(|item| include.iter().any(|g| g.is_match(item))) {
            return false;
        }
        if items.clone().any(|item| exclude.iter().any(|g| g.is_match(item))) {
            return false;
        }
        true
    }

    /// Like [`FilterChain::collection_admits`] but over key/value pairs
    /// (tag pairs), where both halves of a rule must match the same tag.
    fn pair_collection_admits<'a>(
        include: &[(Glob, Glob)],
        exclude: &[(Glob, Glob)],
        pairs: impl Iterator<Item = (&'a String, &'a String)> + Clone,
    ) -> bool {
        let pair_matches = |(kg, vg): &(Glob, Glob)| {
            pairs.clone().any(|(k, v)| kg.is_match(k) && vg.is_match(v))
        };
        if !include.is_empty() && !include.iter().any(pair_matches) {
            return false;
        }
        if exclude.iter().any(pair_matches) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{FieldValue, MeasurementKind, Timestamp};
    use std::collections::BTreeMap;

    fn measurement(name: &str, tags: &[(&str, &str)]) -> Measurement {
        let mut field_map = BTreeMap::new();
        field_map.insert("value".to_owned(), FieldValue::Int64(1));
        let tag_map = tags.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        Measurement::new(name, tag_map, field_map, Timestamp::now(), MeasurementKind::Gauge).unwrap()
    }

    #[test]
    fn empty_spec_admits_everything() {
        let chain = FilterChain::compile(FilterSpec::default());
        let mut m = measurement("cpu", &[("host", "a")]);
        assert!(chain.apply(&mut m));
    }

    #[test]
    fn name_include_restricts_to_matches() {
        let spec = FilterSpec { name_include: vec!["cpu*".to_owned()], ..Default::default() };
        let chain = FilterChain::compile(spec);
        assert!(chain.apply(&mut measurement("cpu_usage", &[])));
        assert!(!chain.apply(&mut measurement("mem_usage", &[])));
    }

    #[test]
    fn name_exclude_rejects_matches() {
        let spec = FilterSpec { name_exclude: vec!["*_internal".to_owned()], ..Default::default() };
        let chain = FilterChain::compile(spec);
        assert!(chain.apply(&mut measurement("cpu", &[])));
        assert!(!chain.apply(&mut measurement("agent_internal", &[])));
    }

    #[test]
    fn tag_key_include_requires_at_least_one_match() {
        let spec = FilterSpec { tag_key_include: vec!["host".to_owned()], ..Default::default() };
        let chain = FilterChain::compile(spec);
        assert!(chain.apply(&mut measurement("cpu", &[("host", "a")])));
        assert!(!chain.apply(&mut measurement("cpu", &[("region", "us")])));
    }

    #[test]
    fn tag_pair_exclude_rejects_specific_value() {
        let spec = FilterSpec {
            tag_pair_exclude: vec![("env".to_owned(), "test".to_owned())],
            ..Default::default()
        };
        let chain = FilterChain::compile(spec);
        assert!(chain.apply(&mut measurement("cpu", &[("env", "prod")])));
        assert!(!chain.apply(&mut measurement("cpu", &[("env", "test")])));
    }

    #[test]
    fn admission_applies_drop_and_add_mutations() {
        let spec = FilterSpec {
            drop_tags: vec!["secret".to_owned()],
            add_tags: vec![("region".to_owned(), "us-east".to_owned())],
            ..Default::default()
        };
        let chain = FilterChain::compile(spec);
        let mut m = measurement("cpu", &[("secret", "x"), ("host", "a")]);
        assert!(chain.apply(&mut m));
        assert!(!m.tags().contains_key("secret"));
        assert_eq!(m.tags().get("region").map(String::as_str), Some("us-east"));
        assert!(m.tags().contains_key("host"));
    }

    #[test]
    fn rejected_measurement_is_not_mutated() {
        let spec = FilterSpec { name_include: vec!["mem*".to_owned()], drop_tags: vec!["host".to_owned()], ..Default::default() };
        let chain = FilterChain::compile(spec);
        let mut m = measurement("cpu", &[("host", "a")]);
        assert!(!chain.apply(&mut m));
        assert!(m.tags().contains_key("host"));
    }

    #[test]
    fn field_key_include_and_exclude_combine() {
        let spec = FilterSpec {
            field_key_include: vec!["val*".to_owned()],
            field_key_exclude: vec!["value_internal".to_owned()],
            ..Default::default()
        };
        let chain = FilterChain::compile(spec);
        assert!(chain.apply(&mut measurement("cpu", &[])));
    }
}
