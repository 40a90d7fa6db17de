use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Reserved label that routes an entry to a tenant other than the endpoint's
/// configured one. It is stripped before the stream is fingerprinted.
pub const TENANT_LABEL: &str = "__tenant_id__";

/// An unordered set of label name/value pairs.
///
/// Backed by a `BTreeMap`, so iteration and the canonical string form are
/// always in key order regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns `defaults` overlaid with `self`: on a name conflict the value in
    /// `self` wins.
    pub fn with_defaults(&self, defaults: &LabelSet) -> LabelSet {
        if defaults.is_empty() {
            return self.clone();
        }
        let mut merged = defaults.0.clone();
        merged.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        LabelSet(merged)
    }

    /// Canonical string form, e.g. `{app="api", env="prod"}`.
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(2 + self.0.len() * 16);
        out.push('{');
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(name);
            out.push('=');
            write_quoted(&mut out, value);
        }
        out.push('}');
        out
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_canonical(self.canonical())
    }
}

fn write_quoted(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for LabelSet {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Grouping key of a stream.
///
/// The FNV-1a hash of the canonical label string, kept together with the
/// string itself: hashing uses only the 64-bit value, equality also compares
/// the string, so two label sets that collide never share a stream.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    value: u64,
    canonical: Arc<str>,
}

impl Fingerprint {
    fn from_canonical(canonical: String) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(canonical.as_bytes());
        Self {
            value: hasher.finish(),
            canonical: canonical.into(),
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.canonical == other.canonical
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.value);
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form_is_sorted_and_quoted() {
        let labels = LabelSet::from([("job", "varlogs"), ("app", "api")]);
        assert_eq!(labels.canonical(), r#"{app="api", job="varlogs"}"#);
        assert_eq!(LabelSet::new().canonical(), "{}");
    }

    #[test]
    fn test_values_are_escaped() {
        let labels = LabelSet::from([("msg", "say \"hi\"\n\\")]);
        assert_eq!(labels.canonical(), r#"{msg="say \"hi\"\n\\"}"#);
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let mut a = LabelSet::new();
        a.insert("foo", "bar");
        a.insert("env", "prod");
        let mut b = LabelSet::new();
        b.insert("env", "prod");
        b.insert("foo", "bar");

        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().value(), b.fingerprint().value());
    }

    #[test]
    fn test_fingerprint_is_stable_fnv1a() {
        let mut hasher = FnvHasher::default();
        hasher.write(b"{}");
        assert_eq!(LabelSet::new().fingerprint().value(), hasher.finish());
        assert_ne!(
            LabelSet::from([("a", "1")]).fingerprint(),
            LabelSet::from([("a", "2")]).fingerprint()
        );
    }

    #[test]
    fn test_with_defaults_prefers_own_values() {
        let entry = LabelSet::from([("lbl", "entry"), ("foo", "bar")]);
        let external = LabelSet::from([("lbl", "external"), ("cluster", "eu")]);

        let merged = entry.with_defaults(&external);
        assert_eq!(merged.get("lbl"), Some("entry"));
        assert_eq!(merged.get("cluster"), Some("eu"));
        assert_eq!(merged.len(), 3);
    }
}
