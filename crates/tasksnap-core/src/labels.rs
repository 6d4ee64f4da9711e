//! Task label sets and the filters matched against them.
//!
//! A [`LabelSet`] is immutable once built: changing a task's labels installs a
//! new set rather than mutating the old one, so any holder of a previous set
//! keeps a stable value. Keys are unique within a set; when the same key is
//! supplied twice the last value wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An immutable, cheaply clonable set of `key=value` labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(Arc<BTreeMap<String, String>>);

impl LabelSet {
    /// The empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `(key, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        pairs.into_iter().collect()
    }

    /// Value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set carries no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// A new set with `key` set to `value`, leaving `self` untouched.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut map = (*self.0).clone();
        map.insert(key.into(), value.into());
        Self(Arc::new(map))
    }

    /// A new set holding this set's labels overridden by `other`'s.
    #[must_use]
    pub fn merged(&self, other: &LabelSet) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut map = (*self.0).clone();
        map.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(Arc::new(map))
    }

    /// Whether every pair in `filter` is present in this set.
    #[must_use]
    pub fn matches(&self, filter: &LabelFilter) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.get(key) == Some(value))
    }

    /// Deep copy into an owned map, detached from this set.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        (*self.0).clone()
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map: BTreeMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self(Arc::new(map))
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

/// A set of `key=value` pairs a task must all carry to be captured.
///
/// The empty filter matches every task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelFilter {
    pairs: BTreeMap<String, String>,
}

impl LabelFilter {
    /// The empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from `(key, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Whether the filter places no restriction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of required pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Iterate required pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for LabelFilter {
    fn from(pairs: BTreeMap<String, String>) -> Self {
        Self { pairs }
    }
}
