use crate::node::{ContextSet, Node, Tristate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

// ═══════════════════════════════════════════════════════════════════════════════
// Meta Bundle
// ═══════════════════════════════════════════════════════════════════════════════

/// Prefixes, suffixes and meta values resolved for one context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaBundle {
    prefixes: Vec<(i32, String)>,
    suffixes: Vec<(i32, String)>,
    meta: HashMap<String, String>,
    primary_group: Option<String>,
}

impl MetaBundle {
    /// The prefix with the highest priority; chain order breaks ties.
    pub fn prefix(&self) -> Option<&str> {
        self.prefixes.first().map(|(_, text)| text.as_str())
    }

    /// The suffix with the highest priority; chain order breaks ties.
    pub fn suffix(&self) -> Option<&str> {
        self.suffixes.first().map(|(_, text)| text.as_str())
    }

    /// Every prefix, highest priority first.
    pub fn prefixes(&self) -> &[(i32, String)] {
        &self.prefixes
    }

    /// Every suffix, highest priority first.
    pub fn suffixes(&self) -> &[(i32, String)] {
        &self.suffixes
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn meta(&self) -> &HashMap<String, String> {
        &self.meta
    }

    pub fn primary_group(&self) -> Option<&str> {
        self.primary_group.as_deref()
    }
}

/// Accumulates meta in chain order.
#[derive(Debug, Default)]
pub(crate) struct MetaAccumulator {
    prefixes: Vec<(i32, String)>,
    suffixes: Vec<(i32, String)>,
    meta: HashMap<String, String>,
}

impl MetaAccumulator {
    pub(crate) fn add_prefix(&mut self, priority: i32, text: String) {
        self.prefixes.push((priority, text));
    }

    pub(crate) fn add_suffix(&mut self, priority: i32, text: String) {
        self.suffixes.push((priority, text));
    }

    /// First value in chain order wins.
    pub(crate) fn add_meta(&mut self, key: String, value: String) {
        self.meta.entry(key).or_insert(value);
    }

    pub(crate) fn finish(mut self, primary_group: Option<String>) -> MetaBundle {
        // stable: equal priorities keep chain order
        self.prefixes.sort_by(|a, b| b.0.cmp(&a.0));
        self.suffixes.sort_by(|a, b| b.0.cmp(&a.0));
        MetaBundle {
            prefixes: self.prefixes,
            suffixes: self.suffixes,
            meta: self.meta,
            primary_group,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolved Result
// ═══════════════════════════════════════════════════════════════════════════════

/// Effective permissions and meta of one holder under one context set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResult {
    contexts: ContextSet,
    permissions: HashMap<String, bool>,
    wildcards: Vec<Node>,
    meta: MetaBundle,
    groups: Vec<String>,
    computed_at: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
}

impl ResolvedResult {
    pub(crate) fn new(
        contexts: ContextSet,
        permissions: HashMap<String, bool>,
        wildcards: Vec<Node>,
        meta: MetaBundle,
        groups: Vec<String>,
        computed_at: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            contexts,
            permissions,
            wildcards,
            meta,
            groups,
            computed_at,
            valid_until,
        }
    }

    /// The value of a permission.
    ///
    /// An exact entry always wins; otherwise the first covering wildcard in
    /// priority order decides.
    pub fn check(&self, permission: &str) -> Tristate {
        if let Some(value) = self.permissions.get(permission) {
            return Tristate::from_bool(*value);
        }
        self.wildcards
            .iter()
            .find(|w| w.wildcard_matches(permission))
            .map(|w| Tristate::from_bool(w.value()))
            .unwrap_or(Tristate::Undefined)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.check(permission).as_bool()
    }

    /// Flat map of every permission decided by a node or group membership.
    pub fn permissions(&self) -> &HashMap<String, bool> {
        &self.permissions
    }

    /// Wildcard nodes in the order they are consulted.
    pub fn wildcards(&self) -> &[Node] {
        &self.wildcards
    }

    pub fn meta(&self) -> &MetaBundle {
        &self.meta
    }

    /// Groups of the inheritance chain, closest first.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    /// Earliest expiry among the nodes that contributed; the result is stale from then on.
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.valid_until
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.valid_until, Some(until) if until <= now)
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}
