//! Resolution: effective permissions and meta across the inheritance graph.
//!
//! The chain is the subject followed by its groups level by level. Within a
//! level, the primary group comes first, then parents by name, then the level
//! is stable-sorted by weight descending. The first node seen for an exact
//! permission decides it; wildcards only fill in what no exact node decided.

mod platform;
mod result;

pub use platform::{PlatformContext, StaticPlatformContext};
pub use result::{MetaBundle, ResolvedResult};

use crate::config::ResolutionConfig;
use crate::model::{Group, GroupManager, Holder, HolderType};
use crate::node::{ContextSet, MetaNode, Node, GROUP_NODE_PREFIX};
use crate::telemetry::metrics::{INCONSISTENT_REFERENCES, RESOLUTIONS, RESOLUTION_DURATION};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use result::MetaAccumulator;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};

/// Toggles of the resolution algorithm.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionOptions {
    pub apply_wildcards: bool,
    pub apply_group_pseudo_permissions: bool,
}

impl Default for ResolutionOptions {
    fn default() -> Self {
        Self {
            apply_wildcards: true,
            apply_group_pseudo_permissions: true,
        }
    }
}

impl From<&ResolutionConfig> for ResolutionOptions {
    fn from(config: &ResolutionConfig) -> Self {
        Self {
            apply_wildcards: config.apply_wildcards,
            apply_group_pseudo_permissions: config.apply_group_pseudo_permissions,
        }
    }
}

/// Walks the inheritance graph of a holder.
///
/// Safe to share between threads; resolution only reads node snapshots and
/// never touches storage.
#[derive(Debug, Clone)]
pub struct ResolutionEngine {
    groups: Arc<GroupManager>,
    options: ResolutionOptions,
}

impl ResolutionEngine {
    pub fn new(groups: Arc<GroupManager>, options: ResolutionOptions) -> Self {
        Self { groups, options }
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    pub fn options(&self) -> ResolutionOptions {
        self.options
    }

    pub fn resolve(&self, subject: &dyn Holder, query: &ContextSet) -> ResolvedResult {
        self.resolve_at(subject, query, Utc::now())
    }

    /// Resolve against a fixed clock.
    pub fn resolve_at(&self, subject: &dyn Holder, query: &ContextSet, now: DateTime<Utc>) -> ResolvedResult {
        let started = Instant::now();
        let chain = self.inheritance_chain(subject, query, now);

        let mut permissions: HashMap<String, bool> = HashMap::new();
        let mut wildcards: Vec<Node> = Vec::new();
        let mut seen_wildcards: HashSet<String> = HashSet::new();
        let mut meta = MetaAccumulator::default();
        let mut valid_until: Option<DateTime<Utc>> = None;

        let subject_nodes = subject.nodes();
        let levels = std::iter::once(subject_nodes).chain(chain.iter().map(|g| g.nodes()));
        for nodes in levels {
            for node in nodes.iter().filter(|n| n.is_active(query, now)) {
                if let Some(expiry) = node.expiry() {
                    valid_until = Some(valid_until.map_or(expiry, |v| v.min(expiry)));
                }
                self.accumulate(node, &mut permissions, &mut wildcards, &mut seen_wildcards, &mut meta);
            }
        }

        let group_names: Vec<String> = chain.iter().map(|g| g.name().to_string()).collect();
        if self.options.apply_group_pseudo_permissions {
            if subject.holder_type() == HolderType::Group {
                permissions
                    .entry(format!("{}{}", GROUP_NODE_PREFIX, subject.object_name()))
                    .or_insert(true);
            }
            for name in &group_names {
                permissions
                    .entry(format!("{}{}", GROUP_NODE_PREFIX, name))
                    .or_insert(true);
            }
        }

        counter!(RESOLUTIONS, "holder" => subject.holder_type().as_str()).increment(1);
        histogram!(RESOLUTION_DURATION).record(started.elapsed().as_secs_f64());
        trace!(
            subject = %subject.object_name(),
            contexts = %query,
            chain_len = group_names.len(),
            permissions = permissions.len(),
            "Resolved holder"
        );

        ResolvedResult::new(
            query.clone(),
            permissions,
            wildcards,
            meta.finish(subject.primary_group()),
            group_names,
            now,
            valid_until,
        )
    }

    fn accumulate(
        &self,
        node: &Node,
        permissions: &mut HashMap<String, bool>,
        wildcards: &mut Vec<Node>,
        seen_wildcards: &mut HashSet<String>,
        meta: &mut MetaAccumulator,
    ) {
        permissions
            .entry(node.permission().to_string())
            .or_insert(node.value());

        if self.options.apply_wildcards && node.is_wildcard() && seen_wildcards.insert(node.permission().to_string()) {
            wildcards.push(node.clone());
        }

        if !node.value() {
            return;
        }
        match node.meta_node() {
            Some(MetaNode::Prefix { priority, text }) => meta.add_prefix(priority, text),
            Some(MetaNode::Suffix { priority, text }) => meta.add_suffix(priority, text),
            Some(MetaNode::Meta { key, value }) => meta.add_meta(key, value),
            Some(MetaNode::Weight(_)) | None => {}
        }
    }

    /// Groups inherited by `subject` in `query` at `now`, closest first.
    ///
    /// Each group appears at most once; cycles and missing groups are skipped.
    pub fn inheritance_chain(&self, subject: &dyn Holder, query: &ContextSet, now: DateTime<Utc>) -> Vec<Arc<Group>> {
        let mut visited: HashSet<String> = HashSet::new();
        if subject.holder_type() == HolderType::Group {
            visited.insert(subject.object_name());
        }

        // (group, referrer) pairs of the next level
        let subject_name = subject.object_name();
        let mut pending: Vec<(String, String)> = Vec::new();
        if let Some(primary) = subject.primary_group() {
            pending.push((primary.to_lowercase(), subject_name.clone()));
        }
        for parent in sorted(subject.parent_groups(query, now)) {
            pending.push((parent, subject_name.clone()));
        }

        let mut chain: Vec<Arc<Group>> = Vec::new();
        while !pending.is_empty() {
            let mut level: Vec<Arc<Group>> = Vec::new();
            for (name, referrer) in pending.drain(..) {
                if !visited.insert(name.clone()) {
                    continue;
                }
                match self.groups.get(&name) {
                    Some(group) => level.push(group),
                    None => {
                        counter!(INCONSISTENT_REFERENCES, "referrer" => "holder").increment(1);
                        warn!(
                            referrer = %referrer,
                            missing = %name,
                            "Skipping missing group in inheritance chain"
                        );
                    }
                }
            }

            level.sort_by_key(|g| std::cmp::Reverse(g.weight_at(now)));

            for group in &level {
                for parent in sorted(group.parent_groups(query, now)) {
                    pending.push((parent, group.name().to_string()));
                }
            }
            chain.extend(level);
        }

        chain
    }
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use crate::node::Tristate;
    use uuid::Uuid;

    fn engine() -> (ResolutionEngine, Arc<GroupManager>) {
        let groups = Arc::new(GroupManager::new());
        (ResolutionEngine::new(groups.clone(), ResolutionOptions::default()), groups)
    }

    fn grant(holder: &dyn Holder, node: &str) {
        holder.set_permission(Node::parse(node).unwrap()).unwrap();
    }

    #[test]
    fn test_empty_holder_yields_empty_result() {
        let (engine, _) = engine();
        let group = Group::new("lonely");
        let result = engine.resolve(&group, &ContextSet::empty());
        assert_eq!(result.permissions().len(), 1);
        assert_eq!(result.check("group.lonely"), Tristate::True);

        let bare = ResolutionEngine::new(
            Arc::new(GroupManager::new()),
            ResolutionOptions { apply_wildcards: true, apply_group_pseudo_permissions: false },
        );
        assert!(bare.resolve(&group, &ContextSet::empty()).is_empty());
    }

    #[test]
    fn test_default_and_vip_scenario() {
        let (engine, groups) = engine();
        let default = groups.get_or_make("default");
        grant(default.as_ref(), "essentials.spawn");
        let vip = groups.get_or_make("vip");
        vip.set_weight(10).unwrap();
        grant(vip.as_ref(), "essentials.fly(server=survival)");

        let user = User::new(Uuid::new_v4(), Some("u"), "default");

        let survival = engine.resolve(&user, &ContextSet::singleton("server", "survival"));
        let expected: HashMap<String, bool> = [
            ("essentials.spawn".to_string(), true),
            ("group.default".to_string(), true),
        ]
        .into_iter()
        .collect();
        assert_eq!(survival.permissions(), &expected);
        assert_eq!(survival.check("group.vip"), Tristate::Undefined);

        let creative = engine.resolve(&user, &ContextSet::singleton("server", "creative"));
        assert_eq!(creative.permissions(), &expected);
    }

    #[test]
    fn test_member_of_contextual_group() {
        let (engine, groups) = engine();
        grant(groups.get_or_make("default").as_ref(), "essentials.spawn");
        grant(groups.get_or_make("vip").as_ref(), "essentials.fly(server=survival)");

        let user = User::new(Uuid::new_v4(), None, "default");
        grant(&user, "group.vip");

        let survival = engine.resolve(&user, &ContextSet::singleton("server", "survival"));
        assert_eq!(survival.check("essentials.fly"), Tristate::True);
        assert_eq!(survival.check("group.vip"), Tristate::True);

        let creative = engine.resolve(&user, &ContextSet::singleton("server", "creative"));
        assert_eq!(creative.check("essentials.fly"), Tristate::Undefined);
    }

    #[test]
    fn test_subject_negation_beats_inherited_wildcard() {
        let (engine, groups) = engine();
        grant(groups.get_or_make("admin").as_ref(), "essentials.*");
        let user = User::new(Uuid::new_v4(), None, "admin");
        grant(&user, "-essentials.fly");

        for query in [ContextSet::empty(), ContextSet::singleton("server", "x")] {
            let result = engine.resolve(&user, &query);
            assert_eq!(result.check("essentials.fly"), Tristate::False);
            assert_eq!(result.check("essentials.home"), Tristate::True);
        }
    }

    #[test]
    fn test_higher_priority_negation_suppresses_lower_wildcard() {
        let (engine, groups) = engine();
        let near = groups.get_or_make("near");
        let far = groups.get_or_make("far");
        grant(near.as_ref(), "-plugin.use");
        grant(near.as_ref(), "group.far");
        grant(far.as_ref(), "plugin.*");

        let user = User::new(Uuid::new_v4(), None, "near");
        let result = engine.resolve(&user, &ContextSet::empty());
        assert_eq!(result.check("plugin.use"), Tristate::False);
        assert_eq!(result.check("plugin.other"), Tristate::True);
    }

    #[test]
    fn test_expired_nodes_never_resolve() {
        let (engine, groups) = engine();
        let group = groups.get_or_make("default");
        grant(group.as_ref(), "temp.perm$1000");
        let user = User::new(Uuid::new_v4(), None, "default");
        grant(&user, "user.temp$1000");

        let result = engine.resolve(&user, &ContextSet::empty());
        assert_eq!(result.check("temp.perm"), Tristate::Undefined);
        assert_eq!(result.check("user.temp"), Tristate::Undefined);
    }

    #[test]
    fn test_fixed_clock() {
        let (engine, _) = engine();
        let user = User::new(Uuid::new_v4(), None, "default");
        grant(&user, "a$2000000000");
        let before = DateTime::from_timestamp(1_999_999_999, 0).unwrap();
        let after = DateTime::from_timestamp(2_000_000_000, 0).unwrap();
        assert!(engine.resolve_at(&user, &ContextSet::empty(), before).has_permission("a"));
        assert!(!engine.resolve_at(&user, &ContextSet::empty(), after).has_permission("a"));

        let early = engine.resolve_at(&user, &ContextSet::empty(), before);
        assert_eq!(early.valid_until(), Some(after));
        assert!(early.is_stale_at(after));
    }

    #[test]
    fn test_cyclic_inheritance_applies_each_group_once() {
        let (engine, groups) = engine();
        let a = groups.get_or_make("a");
        let b = groups.get_or_make("b");
        grant(a.as_ref(), "group.b");
        grant(a.as_ref(), "perm.a");
        grant(b.as_ref(), "group.a");
        grant(b.as_ref(), "perm.b");
        grant(b.as_ref(), "prefix.1.[B]");

        let user = User::new(Uuid::new_v4(), None, "a");
        let result = engine.resolve(&user, &ContextSet::empty());
        assert_eq!(result.groups(), &["a".to_string(), "b".to_string()]);
        assert!(result.has_permission("perm.a"));
        assert!(result.has_permission("perm.b"));
        assert_eq!(result.meta().prefixes().len(), 1);

        let from_group = engine.resolve(a.as_ref(), &ContextSet::empty());
        assert_eq!(from_group.groups(), &["b".to_string()]);
    }

    #[test]
    fn test_depth_then_weight_ordering() {
        let (engine, groups) = engine();
        let light = groups.get_or_make("light");
        let heavy = groups.get_or_make("heavy");
        let deep = groups.get_or_make("deep");
        heavy.set_weight(100).unwrap();
        deep.set_weight(1000).unwrap();
        grant(light.as_ref(), "-kit.vip");
        grant(light.as_ref(), "group.deep");
        grant(heavy.as_ref(), "kit.vip");
        grant(deep.as_ref(), "-kit.other");
        grant(heavy.as_ref(), "kit.other");

        let user = User::new(Uuid::new_v4(), None, "light");
        grant(&user, "group.heavy");

        let result = engine.resolve(&user, &ContextSet::empty());
        // same depth: heavier group first
        assert_eq!(result.groups(), &["heavy".to_string(), "light".to_string(), "deep".to_string()]);
        assert!(result.has_permission("kit.vip"));
        // closer depth beats higher weight
        assert!(result.has_permission("kit.other"));
    }

    #[test]
    fn test_missing_group_is_skipped() {
        let (engine, groups) = engine();
        grant(groups.get_or_make("present").as_ref(), "a.b");
        let user = User::new(Uuid::new_v4(), None, "deleted");
        grant(&user, "group.present");

        let result = engine.resolve(&user, &ContextSet::empty());
        assert!(result.has_permission("a.b"));
        assert_eq!(result.groups(), &["present".to_string()]);
        assert_eq!(result.check("group.deleted"), Tristate::Undefined);
    }

    #[test]
    fn test_meta_resolution() {
        let (engine, groups) = engine();
        let default = groups.get_or_make("default");
        grant(default.as_ref(), "prefix.10.[Member] ");
        grant(default.as_ref(), "meta.color.grey");
        grant(default.as_ref(), "suffix.5.!");
        let user = User::new(Uuid::new_v4(), None, "default");
        grant(&user, "prefix.10.[Me] ");
        grant(&user, "meta.color.gold");
        grant(&user, "-prefix.100.[Denied]");

        let meta = engine.resolve(&user, &ContextSet::empty()).meta().clone();
        assert_eq!(meta.prefix(), Some("[Me] "));
        assert_eq!(meta.suffix(), Some("!"));
        assert_eq!(meta.meta_value("color"), Some("gold"));
        assert_eq!(meta.primary_group(), Some("default"));
    }

    #[test]
    fn test_wildcards_disabled() {
        let groups = Arc::new(GroupManager::new());
        let engine = ResolutionEngine::new(
            groups,
            ResolutionOptions { apply_wildcards: false, apply_group_pseudo_permissions: true },
        );
        let user = User::new(Uuid::new_v4(), None, "default");
        grant(&user, "*");
        let result = engine.resolve(&user, &ContextSet::empty());
        assert_eq!(result.check("*"), Tristate::True);
        assert_eq!(result.check("anything"), Tristate::Undefined);
    }

    #[test]
    fn test_deterministic() {
        let (engine, groups) = engine();
        for (name, weight) in [("a", 5), ("b", 5), ("c", 1)] {
            let g = groups.get_or_make(name);
            g.set_weight(weight).unwrap();
            grant(g.as_ref(), &format!("prefix.1.{}", name));
        }
        let user = User::new(Uuid::new_v4(), None, "c");
        grant(&user, "group.b");
        grant(&user, "group.a");

        let first = engine.resolve_at(&user, &ContextSet::empty(), Utc::now());
        for _ in 0..5 {
            let again = engine.resolve_at(&user, &ContextSet::empty(), first.computed_at());
            assert_eq!(again, first);
        }
        assert_eq!(first.meta().prefix(), Some("a"));
    }
}
