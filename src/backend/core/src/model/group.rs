use super::holder::{Holder, HolderType, NodeStore};
use crate::error::Result;
use crate::node::{MetaNode, Node};
use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// A named, weighted node holder that users and other groups inherit from.
///
/// The weight is carried as a `weight.<n>` node so it persists with the rest
/// of the group's data; without one the weight is 0.
#[derive(Debug)]
pub struct Group {
    name: String,
    store: NodeStore,
}

impl Group {
    /// A detached group. Managed groups are created through the group manager.
    pub fn new(name: &str) -> Self {
        Self::with_epoch(name, None)
    }

    pub(crate) fn with_epoch(name: &str, epoch: Option<Arc<AtomicU64>>) -> Self {
        Self {
            name: name.to_lowercase(),
            store: NodeStore::new(epoch),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Weight in effect at `now`: the highest live, global `weight.<n>` node.
    pub fn weight_at(&self, now: DateTime<Utc>) -> i32 {
        self.nodes()
            .iter()
            .filter(|n| n.value() && n.contexts().is_empty() && !n.has_expired(now))
            .filter_map(|n| match n.meta_node() {
                Some(MetaNode::Weight(w)) => Some(w),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn weight(&self) -> i32 {
        self.weight_at(Utc::now())
    }

    /// Replace any weight nodes with a single `weight.<n>`.
    pub fn set_weight(&self, weight: i32) -> Result<()> {
        self.clear_nodes_matching(&|n| matches!(n.meta_node(), Some(MetaNode::Weight(_))));
        if weight != 0 {
            self.set_permission(Node::weight(weight).build())?;
        }
        Ok(())
    }
}

impl Holder for Group {
    fn object_name(&self) -> String {
        self.name.clone()
    }

    fn holder_type(&self) -> HolderType {
        HolderType::Group
    }

    fn store(&self) -> &NodeStore {
        &self.store
    }
}
