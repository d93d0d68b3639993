//! Node ownership shared by users and groups.

use crate::error::{PermsError, Result};
use crate::node::{ContextSet, Node};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of node holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderType {
    User,
    Group,
}

impl HolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolderType::User => "user",
            HolderType::Group => "group",
        }
    }
}

impl fmt::Display for HolderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Node Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Copy-on-write node collection.
///
/// Writers are serialized by the inner lock and publish a fresh snapshot;
/// readers clone the current `Arc` and never observe a partial update.
/// The optional shared epoch is bumped on every mutation so dependents of
/// a whole family of holders (every group, for instance) can detect change.
pub struct NodeStore {
    nodes: RwLock<Arc<Vec<Node>>>,
    version: AtomicU64,
    dirty: AtomicBool,
    shared_epoch: Option<Arc<AtomicU64>>,
    io_lock: tokio::sync::Mutex<()>,
}

impl NodeStore {
    pub fn new(shared_epoch: Option<Arc<AtomicU64>>) -> Self {
        Self {
            nodes: RwLock::new(Arc::new(Vec::new())),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            shared_epoch,
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Node>> {
        self.nodes.read().clone()
    }

    /// Incremented on every mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Lock held across a mutate-then-save sequence on one holder.
    pub fn io_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.io_lock
    }

    /// Apply `f` to a copy of the nodes and publish it if `f` reports a change.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<Node>) -> (bool, R)) -> R {
        let mut guard = self.nodes.write();
        let mut next = guard.as_ref().clone();
        let (changed, result) = f(&mut next);
        if changed {
            *guard = Arc::new(next);
            drop(guard);
            self.touch();
        }
        result
    }

    /// Replace every node, e.g. after a load from storage. Leaves the store clean.
    pub fn replace_all(&self, nodes: Vec<Node>) {
        *self.nodes.write() = Arc::new(nodes);
        self.touch();
        self.mark_clean();
    }

    pub(crate) fn touch(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        if let Some(epoch) = &self.shared_epoch {
            epoch.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStore")
            .field("nodes", &self.snapshot().len())
            .field("version", &self.version())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Holder
// ═══════════════════════════════════════════════════════════════════════════════

/// An entity owning an ordered collection of nodes.
pub trait Holder: Send + Sync {
    /// Stable identifier: the UUID of a user, the name of a group.
    fn object_name(&self) -> String;

    fn holder_type(&self) -> HolderType;

    fn store(&self) -> &NodeStore;

    /// Called after every successful node mutation.
    fn on_mutation(&self) {}

    /// Group inherited regardless of nodes. Only users have one.
    fn primary_group(&self) -> Option<String> {
        None
    }

    fn nodes(&self) -> Arc<Vec<Node>> {
        self.store().snapshot()
    }

    /// Add a node.
    ///
    /// Fails with `ObjectAlreadyHas` when a node with the same permission,
    /// contexts and temporariness is present, whatever its value.
    fn set_permission(&self, node: Node) -> Result<()> {
        if node.permission().trim().is_empty() {
            return Err(PermsError::malformed_node(node.serialize(), "empty permission"));
        }
        let added = self.store().update(|nodes| {
            if nodes.iter().any(|n| n.almost_equals(&node)) {
                (false, Err(node))
            } else {
                nodes.push(node);
                (true, Ok(()))
            }
        });
        match added {
            Ok(()) => {
                self.on_mutation();
                Ok(())
            }
            Err(node) => Err(PermsError::already_has(
                self.holder_type().as_str(),
                self.object_name(),
                node.serialize(),
            )),
        }
    }

    /// Remove the node matching `node` by permission, contexts and temporariness.
    fn unset_permission(&self, node: &Node) -> Result<Node> {
        let removed = self.store().update(|nodes| match nodes.iter().position(|n| n.almost_equals(node)) {
            Some(index) => (true, Some(nodes.remove(index))),
            None => (false, None),
        });
        match removed {
            Some(node) => {
                self.on_mutation();
                Ok(node)
            }
            None => Err(PermsError::lacks(
                self.holder_type().as_str(),
                self.object_name(),
                node.serialize(),
            )),
        }
    }

    /// Whether an exactly matching node is present.
    fn has_node(&self, node: &Node) -> bool {
        self.nodes().iter().any(|n| n == node)
    }

    fn set_inherit_group(
        &self,
        group: &str,
        contexts: &ContextSet,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut builder = Node::group(group).with_contexts(contexts);
        if let Some(at) = expiry {
            builder = builder.expiry(at);
        }
        self.set_permission(builder.build())
    }

    fn unset_inherit_group(&self, group: &str, contexts: &ContextSet, temporary: bool) -> Result<Node> {
        let mut builder = Node::group(group).with_contexts(contexts);
        if temporary {
            // any expiry marks the candidate as temporary for `almost_equals`
            builder = builder.expiry_unix(0);
        }
        self.unset_permission(&builder.build())
    }

    /// A live `group.<name>=true` node with exactly these contexts exists.
    fn inherits_group(&self, group: &str, contexts: &ContextSet) -> bool {
        let candidate = Node::group(group).build();
        let now = Utc::now();
        self.nodes().iter().any(|n| {
            n.value()
                && n.permission() == candidate.permission()
                && n.contexts() == contexts
                && !n.has_expired(now)
        })
    }

    /// Names of the groups this holder inherits in `query` at `now`, in declaration order.
    fn parent_groups(&self, query: &ContextSet, now: DateTime<Utc>) -> Vec<String> {
        let mut parents: Vec<String> = Vec::new();
        for node in self.nodes().iter() {
            if !node.value() || !node.is_active(query, now) {
                continue;
            }
            if let Some(name) = node.group_name() {
                let name = name.to_lowercase();
                if !parents.contains(&name) {
                    parents.push(name);
                }
            }
        }
        parents
    }

    /// Remove and return every node that has expired at `now`.
    fn audit_temporary_nodes(&self, now: DateTime<Utc>) -> Vec<Node> {
        let expired = self.store().update(|nodes| {
            let (expired, live): (Vec<Node>, Vec<Node>) =
                nodes.drain(..).partition(|n| n.has_expired(now));
            *nodes = live;
            (!expired.is_empty(), expired)
        });
        if !expired.is_empty() {
            self.on_mutation();
        }
        expired
    }

    /// Remove every node matching `predicate`, returning how many were removed.
    fn clear_nodes_matching(&self, predicate: &dyn Fn(&Node) -> bool) -> usize {
        let removed = self.store().update(|nodes| {
            let before = nodes.len();
            nodes.retain(|n| !predicate(n));
            let removed = before - nodes.len();
            (removed > 0, removed)
        });
        if removed > 0 {
            self.on_mutation();
        }
        removed
    }

    fn clear_nodes(&self) -> usize {
        self.clear_nodes_matching(&|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    struct Bare(NodeStore);

    impl Holder for Bare {
        fn object_name(&self) -> String {
            "bare".to_string()
        }
        fn holder_type(&self) -> HolderType {
            HolderType::Group
        }
        fn store(&self) -> &NodeStore {
            &self.0
        }
    }

    #[test]
    fn test_set_and_unset() {
        let holder = Bare(NodeStore::default());
        holder.set_permission(Node::builder("a.b").build()).unwrap();

        let dup = holder.set_permission(Node::builder("a.b").value(false).build());
        assert_eq!(dup.unwrap_err().code(), ErrorCode::ObjectAlreadyHas);
        assert_eq!(holder.nodes().len(), 1);

        holder.unset_permission(&Node::builder("a.b").build()).unwrap();
        let missing = holder.unset_permission(&Node::builder("a.b").build());
        assert_eq!(missing.unwrap_err().code(), ErrorCode::ObjectLacks);
    }

    #[test]
    fn test_temporary_and_permanent_coexist() {
        let holder = Bare(NodeStore::default());
        holder.set_permission(Node::builder("a").build()).unwrap();
        holder
            .set_permission(Node::builder("a").expiry_unix(4_102_444_800).build())
            .unwrap();
        assert_eq!(holder.nodes().len(), 2);
    }

    #[test]
    fn test_snapshot_isolation() {
        let holder = Bare(NodeStore::default());
        holder.set_permission(Node::builder("a").build()).unwrap();
        let before = holder.nodes();
        holder.set_permission(Node::builder("b").build()).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(holder.nodes().len(), 2);
    }

    #[test]
    fn test_version_and_epoch() {
        let epoch = Arc::new(AtomicU64::new(0));
        let holder = Bare(NodeStore::new(Some(epoch.clone())));
        holder.set_permission(Node::builder("a").build()).unwrap();
        assert_eq!(holder.store().version(), 1);
        assert_eq!(epoch.load(Ordering::Acquire), 1);
        assert!(holder.store().is_dirty());

        // failed mutation changes nothing
        let _ = holder.set_permission(Node::builder("a").build());
        assert_eq!(holder.store().version(), 1);
    }

    #[test]
    fn test_parent_groups_filters() {
        let holder = Bare(NodeStore::default());
        let now = Utc::now();
        holder.set_inherit_group("Admin", &ContextSet::empty(), None).unwrap();
        holder
            .set_inherit_group("builder", &ContextSet::singleton("server", "creative"), None)
            .unwrap();
        holder
            .set_permission(Node::group("old").expiry_unix(1).build())
            .unwrap();
        holder
            .set_permission(Node::group("denied").value(false).build())
            .unwrap();

        assert_eq!(holder.parent_groups(&ContextSet::empty(), now), vec!["admin"]);
        assert_eq!(
            holder.parent_groups(&ContextSet::singleton("server", "creative"), now),
            vec!["admin", "builder"]
        );
        assert!(holder.inherits_group("admin", &ContextSet::empty()));
        assert!(!holder.inherits_group("builder", &ContextSet::empty()));
    }

    #[test]
    fn test_audit_temporary_nodes() {
        let holder = Bare(NodeStore::default());
        holder.set_permission(Node::builder("keep").build()).unwrap();
        holder
            .set_permission(Node::builder("gone").expiry_unix(1_000).build())
            .unwrap();
        let expired = holder.audit_temporary_nodes(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].permission(), "gone");
        assert_eq!(holder.nodes().len(), 1);
    }

    #[test]
    fn test_unset_inherit_group_temporary() {
        let holder = Bare(NodeStore::default());
        holder
            .set_inherit_group("vip", &ContextSet::empty(), Some(Utc::now() + chrono::Duration::days(1)))
            .unwrap();
        assert!(holder.unset_inherit_group("vip", &ContextSet::empty(), false).is_err());
        assert!(holder.unset_inherit_group("vip", &ContextSet::empty(), true).is_ok());
    }
}
