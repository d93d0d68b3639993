use super::holder::{Holder, HolderType, NodeStore};
use crate::cache::UserCache;
use crate::error::{PermsError, Result};
use crate::node::ContextSet;
use parking_lot::RwLock;
use uuid::Uuid;

/// A player or account: a node holder identified by UUID with a primary group.
///
/// Every user owns its resolution cache; any node mutation or primary group
/// change drops the cached results.
#[derive(Debug)]
pub struct User {
    uuid: Uuid,
    username: RwLock<Option<String>>,
    primary_group: RwLock<String>,
    store: NodeStore,
    cache: UserCache,
}

impl User {
    pub fn new(uuid: Uuid, username: Option<&str>, primary_group: &str) -> Self {
        Self {
            uuid,
            username: RwLock::new(username.map(str::to_string)),
            primary_group: RwLock::new(primary_group.to_lowercase()),
            store: NodeStore::default(),
            cache: UserCache::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    /// Record the last known username. Returns true if it changed.
    pub fn set_username(&self, username: &str) -> bool {
        let mut current = self.username.write();
        if current.as_deref() == Some(username) {
            return false;
        }
        *current = Some(username.to_string());
        true
    }

    pub fn primary_group(&self) -> String {
        self.primary_group.read().clone()
    }

    /// Change the primary group to one the user inherits globally.
    ///
    /// Use [`User::set_primary_group_with_default`] where the default group
    /// should be accepted without membership.
    pub fn set_primary_group(&self, group: &str) -> Result<()> {
        self.change_primary_group(group, None)
    }

    /// Like [`User::set_primary_group`], but `default_group` is always allowed.
    pub fn set_primary_group_with_default(&self, group: &str, default_group: &str) -> Result<()> {
        self.change_primary_group(group, Some(default_group))
    }

    fn change_primary_group(&self, group: &str, default_group: Option<&str>) -> Result<()> {
        let group = group.to_lowercase();
        if self.primary_group() == group {
            return Err(PermsError::already_has(
                "user",
                self.uuid.to_string(),
                format!("primary group {}", group),
            ));
        }
        let is_default = default_group.is_some_and(|d| d.eq_ignore_ascii_case(&group));
        if !is_default && !self.inherits_group(&group, &ContextSet::empty()) {
            return Err(PermsError::lacks(
                "user",
                self.uuid.to_string(),
                format!("group.{}", group),
            ));
        }
        self.force_primary_group(&group);
        Ok(())
    }

    /// Set the primary group without membership checks.
    pub(crate) fn force_primary_group(&self, group: &str) {
        *self.primary_group.write() = group.to_lowercase();
        self.store.touch();
        self.cache.invalidate();
    }

    /// Loaded state replaces the in-memory state wholesale.
    pub(crate) fn apply_loaded(&self, username: Option<&str>, primary_group: &str, nodes: Vec<crate::node::Node>) {
        if let Some(name) = username {
            self.set_username(name);
        }
        *self.primary_group.write() = primary_group.to_lowercase();
        self.store.replace_all(nodes);
        self.cache.invalidate();
    }

    /// Nothing but the default primary group and, at most, its inheritance node.
    pub fn has_only_defaults(&self, default_group: &str) -> bool {
        if self.primary_group() != default_group {
            return false;
        }
        self.nodes()
            .iter()
            .all(|n| n.value() && n.contexts().is_empty() && n.is_permanent() && n.group_name() == Some(default_group))
    }

    pub fn cache(&self) -> &UserCache {
        &self.cache
    }

    /// Changes on every node mutation and primary group change.
    pub fn version(&self) -> u64 {
        self.store.version()
    }
}

impl Holder for User {
    fn object_name(&self) -> String {
        self.uuid.to_string()
    }

    fn holder_type(&self) -> HolderType {
        HolderType::User
    }

    fn store(&self) -> &NodeStore {
        &self.store
    }

    fn on_mutation(&self) {
        self.cache.invalidate();
    }

    fn primary_group(&self) -> Option<String> {
        Some(User::primary_group(self))
    }
}
