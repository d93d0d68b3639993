//! Context sets: the situational key/value constraints attached to nodes and queries.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Well-known context key for the server a node is scoped to.
pub const SERVER_KEY: &str = "server";

/// Well-known context key for the world a node is scoped to.
pub const WORLD_KEY: &str = "world";

/// Value used by the `server` / `world` shortcuts to mean "no constraint".
pub const GLOBAL_VALUE: &str = "global";

fn normalize(part: &str) -> String {
    part.trim().to_lowercase()
}

type ContextMap = BTreeMap<String, BTreeSet<String>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Immutable Context Set
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable multi-map of context keys to values.
///
/// Keys and values are stored trimmed and lower-cased. Ordering is by key,
/// then value, which makes equality, hashing and serialization canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "ContextMap", into = "ContextMap")]
pub struct ContextSet {
    map: ContextMap,
}

impl ContextSet {
    /// The empty (global) context set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A set with a single pair.
    pub fn singleton(key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let mut set = MutableContextSet::new();
        set.add(key, value);
        set.build()
    }

    /// Build a set from pairs.
    pub fn of<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut set = MutableContextSet::new();
        for (k, v) in pairs {
            set.add(k, v);
        }
        set.build()
    }

    /// Start a mutable builder.
    pub fn builder() -> MutableContextSet {
        MutableContextSet::new()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of key/value pairs.
    pub fn len(&self) -> usize {
        self.map.values().map(BTreeSet::len).sum()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(&normalize(key))
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.map
            .get(&normalize(key))
            .map(|values| values.contains(&normalize(value)))
            .unwrap_or(false)
    }

    /// All values for a key.
    pub fn values(&self, key: &str) -> impl Iterator<Item = &str> {
        self.map
            .get(&normalize(key))
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    /// The first value for a key, if any.
    pub fn any_value(&self, key: &str) -> Option<&str> {
        self.values(key).next()
    }

    /// Iterate over every pair in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// True iff every pair in `self` is also present in `query`.
    ///
    /// The empty set is satisfied by every query.
    pub fn is_satisfied_by(&self, query: &ContextSet) -> bool {
        self.map.iter().all(|(key, values)| match query.map.get(key) {
            Some(present) => values.is_subset(present),
            None => false,
        })
    }

    /// A mutable copy of this set.
    pub fn to_mutable(&self) -> MutableContextSet {
        MutableContextSet {
            map: self.map.clone(),
        }
    }
}

impl From<ContextMap> for ContextSet {
    fn from(raw: ContextMap) -> Self {
        let mut set = MutableContextSet::new();
        for (key, values) in raw {
            for value in values {
                set.add(&key, &value);
            }
        }
        set.build()
    }
}

impl From<ContextSet> for ContextMap {
    fn from(set: ContextSet) -> Self {
        set.map
    }
}

impl fmt::Display for ContextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Mutable Context Set
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder form of [`ContextSet`], used while assembling a node or a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutableContextSet {
    map: ContextMap,
}

impl MutableContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair. Blank keys or values are ignored.
    pub fn add(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> &mut Self {
        let key = normalize(key.as_ref());
        let value = normalize(value.as_ref());
        if !key.is_empty() && !value.is_empty() {
            self.map.entry(key).or_default().insert(value);
        }
        self
    }

    /// Add every pair of another set.
    pub fn add_all(&mut self, other: &ContextSet) -> &mut Self {
        for (k, v) in other.iter() {
            self.add(k, v);
        }
        self
    }

    /// Remove a single pair.
    pub fn remove(&mut self, key: &str, value: &str) -> &mut Self {
        let key = normalize(key);
        if let Some(values) = self.map.get_mut(&key) {
            values.remove(&normalize(value));
            if values.is_empty() {
                self.map.remove(&key);
            }
        }
        self
    }

    /// Remove every value of a key.
    pub fn remove_all(&mut self, key: &str) -> &mut Self {
        self.map.remove(&normalize(key));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Freeze into an immutable set.
    pub fn build(&self) -> ContextSet {
        ContextSet {
            map: self.map.clone(),
        }
    }
}
