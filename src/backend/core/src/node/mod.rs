//! Nodes: single permission or metadata assertions with their qualifiers.
//!
//! A [`Node`] is immutable. Holders replace nodes rather than edit them, so
//! a node can be shared freely between snapshots, results and storage records.

pub mod context;
mod meta;
mod parse;

pub use context::{ContextSet, MutableContextSet, GLOBAL_VALUE, SERVER_KEY, WORLD_KEY};
pub use meta::MetaNode;
pub use parse::{escape, normalize};

use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of inheritance nodes (`group.<name>`).
pub const GROUP_NODE_PREFIX: &str = "group.";

// ═══════════════════════════════════════════════════════════════════════════════
// Tristate
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a permission lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tristate {
    True,
    False,
    /// No node decided the permission
    Undefined,
}

impl Tristate {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Tristate::True
        } else {
            Tristate::False
        }
    }

    /// Collapse to a boolean, treating undefined as denied.
    pub fn as_bool(self) -> bool {
        matches!(self, Tristate::True)
    }

    pub fn is_defined(self) -> bool {
        !matches!(self, Tristate::Undefined)
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        Tristate::from_bool(value)
    }
}

impl From<Option<bool>> for Tristate {
    fn from(value: Option<bool>) -> Self {
        value.map(Tristate::from_bool).unwrap_or(Tristate::Undefined)
    }
}

impl fmt::Display for Tristate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tristate::True => write!(f, "true"),
            Tristate::False => write!(f, "false"),
            Tristate::Undefined => write!(f, "undefined"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Node
// ═══════════════════════════════════════════════════════════════════════════════

/// One permission or metadata assertion.
///
/// Two nodes are equal when permission, value, contexts and expiry are all
/// equal. Expiry is held at whole-second precision so the serialized form
/// round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    permission: String,
    value: bool,
    #[serde(default, skip_serializing_if = "ContextSet::is_empty")]
    contexts: ContextSet,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    expiry: Option<DateTime<Utc>>,
}

impl Node {
    /// Start building a node for a permission.
    ///
    /// A leading `-` on the permission is read as a negation.
    pub fn builder(permission: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(permission)
    }

    /// Builder for an inheritance node `group.<name>`.
    pub fn group(name: &str) -> NodeBuilder {
        NodeBuilder::new(format!("{}{}", GROUP_NODE_PREFIX, name.trim().to_lowercase()))
    }

    /// Builder for `prefix.<priority>.<text>`.
    pub fn prefix(priority: i32, text: &str) -> NodeBuilder {
        NodeBuilder::new(format!("prefix.{}.{}", priority, text))
    }

    /// Builder for `suffix.<priority>.<text>`.
    pub fn suffix(priority: i32, text: &str) -> NodeBuilder {
        NodeBuilder::new(format!("suffix.{}.{}", priority, text))
    }

    /// Builder for `meta.<key>.<value>`; dots in the key are escaped.
    pub fn meta(key: &str, value: &str) -> NodeBuilder {
        NodeBuilder::new(format!("meta.{}.{}", key.replace('.', "\\."), value))
    }

    /// Builder for `weight.<n>`.
    pub fn weight(weight: i32) -> NodeBuilder {
        NodeBuilder::new(format!("weight.{}", weight))
    }

    /// Parse the serialized form.
    pub fn parse(input: &str) -> Result<Node> {
        parse::parse(input)
    }

    /// The canonical serialized form; the exact inverse of [`Node::parse`].
    pub fn serialize(&self) -> String {
        parse::serialize(self)
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }

    pub fn value(&self) -> bool {
        self.value
    }

    pub fn is_negated(&self) -> bool {
        !self.value
    }

    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    pub fn is_temporary(&self) -> bool {
        self.expiry.is_some()
    }

    pub fn is_permanent(&self) -> bool {
        self.expiry.is_none()
    }

    /// The `server` context value, if the node is scoped to one.
    pub fn server(&self) -> Option<&str> {
        self.contexts.any_value(SERVER_KEY)
    }

    /// The `world` context value, if the node is scoped to one.
    pub fn world(&self) -> Option<&str> {
        self.contexts.any_value(WORLD_KEY)
    }

    /// True once `now` has reached the expiry.
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }

    /// True iff every context pair on the node is present in `query`.
    pub fn applies(&self, query: &ContextSet) -> bool {
        self.contexts.is_satisfied_by(query)
    }

    /// Live and applicable in `query` at `now`.
    pub fn is_active(&self, query: &ContextSet, now: DateTime<Utc>) -> bool {
        !self.has_expired(now) && self.applies(query)
    }

    pub fn is_wildcard(&self) -> bool {
        self.permission == "*" || self.permission.ends_with(".*")
    }

    /// Whether this wildcard covers `permission`.
    ///
    /// `*` covers everything; `a.b.*` covers anything starting with `a.b.`.
    /// Non-wildcard nodes cover nothing.
    pub fn wildcard_matches(&self, permission: &str) -> bool {
        if self.permission == "*" {
            return true;
        }
        match self.permission.strip_suffix('*') {
            Some(stem) if stem.ends_with('.') => permission.len() > stem.len() && permission.starts_with(stem),
            _ => false,
        }
    }

    /// The group named by an inheritance node.
    pub fn group_name(&self) -> Option<&str> {
        self.permission
            .strip_prefix(GROUP_NODE_PREFIX)
            .filter(|name| !name.is_empty())
    }

    pub fn is_group_node(&self) -> bool {
        self.group_name().is_some()
    }

    /// Decode a meta node, if this is one.
    pub fn meta_node(&self) -> Option<MetaNode> {
        MetaNode::decode(&self.permission)
    }

    /// Same permission, contexts and expiry; value ignored.
    pub fn equals_ignoring_value(&self, other: &Node) -> bool {
        self.permission == other.permission
            && self.contexts == other.contexts
            && self.expiry == other.expiry
    }

    /// Same permission, contexts and temporariness; value and exact expiry ignored.
    ///
    /// A holder never contains two nodes that are almost equal.
    pub fn almost_equals(&self, other: &Node) -> bool {
        self.permission == other.permission
            && self.contexts == other.contexts
            && self.is_temporary() == other.is_temporary()
    }

    /// A builder seeded with this node.
    pub fn to_builder(&self) -> NodeBuilder {
        NodeBuilder {
            permission: self.permission.clone(),
            value: self.value,
            contexts: self.contexts.to_mutable(),
            expiry: self.expiry,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl std::str::FromStr for Node {
    type Err = crate::error::PermsError;

    fn from_str(s: &str) -> Result<Self> {
        Node::parse(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`Node`].
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    permission: String,
    value: bool,
    contexts: MutableContextSet,
    expiry: Option<DateTime<Utc>>,
}

impl NodeBuilder {
    pub fn new(permission: impl Into<String>) -> Self {
        let permission = permission.into();
        let (permission, value) = match permission.strip_prefix('-') {
            Some(rest) => (rest.to_string(), false),
            None => (permission, true),
        };
        Self {
            permission,
            value,
            contexts: MutableContextSet::new(),
            expiry: None,
        }
    }

    pub fn value(mut self, value: bool) -> Self {
        self.value = value;
        self
    }

    /// Scope to a server. `"global"` leaves the node unscoped.
    pub fn server(mut self, server: &str) -> Self {
        self.contexts.remove_all(SERVER_KEY);
        if !server.trim().eq_ignore_ascii_case(GLOBAL_VALUE) {
            self.contexts.add(SERVER_KEY, server);
        }
        self
    }

    /// Scope to a world. `"global"` leaves the node unscoped.
    pub fn world(mut self, world: &str) -> Self {
        self.contexts.remove_all(WORLD_KEY);
        if !world.trim().eq_ignore_ascii_case(GLOBAL_VALUE) {
            self.contexts.add(WORLD_KEY, world);
        }
        self
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.contexts.add(key, value);
        self
    }

    pub fn with_contexts(mut self, contexts: &ContextSet) -> Self {
        self.contexts.add_all(contexts);
        self
    }

    pub fn clear_contexts(mut self) -> Self {
        self.contexts = MutableContextSet::new();
        self
    }

    /// Expire at `at`, truncated to whole seconds.
    pub fn expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expiry = Utc.timestamp_opt(at.timestamp(), 0).single();
        self
    }

    /// Expire at a unix timestamp in seconds.
    pub fn expiry_unix(mut self, seconds: i64) -> Self {
        self.expiry = Utc.timestamp_opt(seconds, 0).single();
        self
    }

    /// Expire `duration` from now.
    pub fn expiry_after(self, duration: chrono::Duration) -> Self {
        self.expiry(Utc::now() + duration)
    }

    pub fn clear_expiry(mut self) -> Self {
        self.expiry = None;
        self
    }

    pub fn build(self) -> Node {
        Node {
            permission: self.permission,
            value: self.value,
            contexts: self.contexts.build(),
            expiry: self.expiry,
        }
    }
}
