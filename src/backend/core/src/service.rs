//! The permission service: managers, storage, engine and audit log wired together.
//!
//! Every mutating operation follows the same sequence: take the entity's I/O
//! lock, apply the change to a detached copy, persist the copy, and only then
//! publish it to the managed entity. A failed save therefore leaves the
//! in-memory state exactly as it was.
//!
//! # Example
//!
//! ```rust,ignore
//! let service = PermissionService::from_config(&config).await?;
//! service.load_all().await?;
//!
//! let user = service.load_user(uuid, Some("steve")).await?;
//! service.grant(&Actor::console(), &HolderId::User(uuid), Node::builder("essentials.fly").build()).await?;
//!
//! let contexts = service.contexts_for(uuid);
//! if service.check_permission(uuid, "essentials.fly", &contexts).as_bool() {
//!     // ...
//! }
//! ```

use crate::cache::{CacheRefresher, RefresherHandle};
use crate::config::Config;
use crate::error::{PermsError, Result};
use crate::model::{
    validate_name, Actor, Group, GroupManager, Holder, LogEntry, Track, TrackManager, User, UserManager,
};
use crate::node::{ContextSet, Node, Tristate};
use crate::resolution::{
    MetaBundle, PlatformContext, ResolutionEngine, ResolutionOptions, ResolvedResult, StaticPlatformContext,
};
use crate::storage::{GroupRecord, Storage, StorageFactory, TrackRecord, UserRecord};
use crate::telemetry::metrics::INCONSISTENT_REFERENCES;
use chrono::Utc;
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// A node holder addressed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HolderId {
    User(Uuid),
    Group(String),
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HolderId::User(uuid) => write!(f, "user {}", uuid),
            HolderId::Group(name) => write!(f, "group {}", name),
        }
    }
}

/// Outcome of a promotion or demotion along a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMove {
    pub track: String,
    pub from: Option<String>,
    pub to: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

pub struct PermissionService {
    config: Config,
    storage: Storage,
    users: Arc<UserManager>,
    groups: Arc<GroupManager>,
    tracks: Arc<TrackManager>,
    engine: ResolutionEngine,
    platform: Arc<dyn PlatformContext>,
}

impl PermissionService {
    pub fn new(config: Config, storage: Storage, platform: Arc<dyn PlatformContext>) -> Self {
        let groups = Arc::new(GroupManager::new());
        let engine = ResolutionEngine::new(groups.clone(), ResolutionOptions::from(&config.resolution));
        Self {
            users: Arc::new(UserManager::new(&config.default_group)),
            tracks: Arc::new(TrackManager::new()),
            groups,
            engine,
            storage,
            platform,
            config,
        }
    }

    /// Build storage from configuration and use a configuration-driven platform context.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let storage = StorageFactory::build(&config.storage).await?;
        let platform = Arc::new(StaticPlatformContext::from_config(config));
        Ok(Self::new(config.clone(), storage, platform))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn users(&self) -> &Arc<UserManager> {
        &self.users
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    pub fn tracks(&self) -> &Arc<TrackManager> {
        &self.tracks
    }

    pub fn engine(&self) -> &ResolutionEngine {
        &self.engine
    }

    pub fn platform(&self) -> &Arc<dyn PlatformContext> {
        &self.platform
    }

    fn default_group(&self) -> &str {
        self.users.default_group()
    }

    /// Ensure the default group exists, then load every group and track.
    #[instrument(skip(self))]
    pub async fn load_all(&self) -> Result<()> {
        let default = self.default_group().to_string();
        let record = self.storage.create_and_load_group(&default).await?;
        record.apply_to(&self.groups.get_or_make(&record.name), Utc::now());

        self.load_all_groups().await?;
        self.load_all_tracks().await?;
        info!(
            groups = self.groups.len(),
            tracks = self.tracks.len(),
            "Loaded groups and tracks"
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.storage.shutdown().await
    }

    fn audit(&self, entry: LogEntry) {
        debug!(entry = %entry, "Audit");
        // fire and forget
        let _ = self.storage.submit_log(entry);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────

    /// Load a user from storage into the manager.
    ///
    /// Users without a stored record, or without any global group membership,
    /// are given the default group.
    #[instrument(skip(self))]
    pub async fn load_user(&self, uuid: Uuid, username: Option<&str>) -> Result<Arc<User>> {
        let record = self.storage.load_user(uuid).await?;
        let now = Utc::now();

        let user = self.users.get_or_make(uuid, None);
        {
            let _guard = user.store().io_lock().lock().await;
            if let Some(record) = &record {
                record.apply_to(&user, now);
            }
            if let Some(name) = username {
                user.set_username(name);
            }
            self.give_default_if_needed(&user, now);
        }

        if let Some(name) = username {
            // a stale cache only affects name lookups
            if let Err(e) = self.storage.save_uuid_data(name, uuid).await {
                warn!(user = %uuid, username = name, error = %e, "Failed to update the UUID cache");
            }
        }
        debug!(user = %uuid, stored = record.is_some(), nodes = user.nodes().len(), "Loaded user");
        Ok(user)
    }

    fn give_default_if_needed(&self, user: &User, now: chrono::DateTime<Utc>) {
        let has_global_group = user
            .nodes()
            .iter()
            .any(|n| n.value() && n.is_group_node() && n.contexts().is_empty() && !n.has_expired(now));
        if has_global_group {
            return;
        }
        let default = self.default_group().to_string();
        if let Err(e) = user.set_inherit_group(&default, &ContextSet::empty(), None) {
            debug!(user = %user.uuid(), error = %e, "Default group already present");
        }
        if user.primary_group() != default {
            user.force_primary_group(&default);
        }
    }

    /// Persist a loaded user.
    #[instrument(skip(self))]
    pub async fn save_user(&self, uuid: Uuid) -> Result<()> {
        let user = self.loaded_user(uuid)?;
        let _guard = user.store().io_lock().lock().await;
        let record = UserRecord::from_user(&user, Utc::now());
        self.storage.save_user(&record).await?;
        user.store().mark_clean();
        Ok(())
    }

    /// Save pending changes of a user and drop it from memory.
    pub async fn cleanup_user(&self, uuid: Uuid) -> Result<()> {
        let Some(user) = self.users.get(uuid) else {
            return Ok(());
        };
        if user.store().is_dirty() {
            self.save_user(uuid).await?;
        }
        self.users.unload(uuid);
        debug!(user = %uuid, "Unloaded user");
        Ok(())
    }

    /// Change a user's primary group. The default group is always allowed.
    pub async fn set_primary_group(&self, actor: &Actor, uuid: Uuid, group: &str) -> Result<()> {
        let user = self.loaded_user(uuid)?;
        let group = group.to_lowercase();
        let default_group = self.default_group().to_string();
        self.update_user(&user, |copy| copy.set_primary_group_with_default(&group, &default_group))
            .await?;
        self.audit(user_entry(actor, &user).action(format!("setprimarygroup {}", group)));
        Ok(())
    }

    fn loaded_user(&self, uuid: Uuid) -> Result<Arc<User>> {
        self.users
            .get(uuid)
            .ok_or_else(|| PermsError::not_found("user", uuid.to_string()))
    }

    async fn update_user<R>(&self, user: &User, change: impl FnOnce(&User) -> Result<R>) -> Result<R> {
        let _guard = user.store().io_lock().lock().await;
        let copy = User::new(user.uuid(), user.username().as_deref(), &user.primary_group());
        copy.store().replace_all(user.nodes().as_ref().clone());

        let outcome = change(&copy)?;
        let now = Utc::now();
        let record = UserRecord::from_user(&copy, now);
        self.storage.save_user(&record).await?;
        record.apply_to(user, now);
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group, or load it if it already exists.
    #[instrument(skip(self, actor))]
    pub async fn create_group(&self, actor: &Actor, name: &str) -> Result<Arc<Group>> {
        let name = validate_name(name)?;
        let record = self.storage.create_and_load_group(&name).await?;
        let group = self.groups.get_or_make(&name);
        record.apply_to(&group, Utc::now());
        self.audit(LogEntry::builder(actor.clone()).group(&name).action("create"));
        Ok(group)
    }

    /// Load one group. `None` when storage has no such group.
    pub async fn load_group(&self, name: &str) -> Result<Option<Arc<Group>>> {
        let name = validate_name(name)?;
        let Some(record) = self.storage.load_group(&name).await? else {
            return Ok(None);
        };
        let group = self.groups.get_or_make(&record.name);
        record.apply_to(&group, Utc::now());
        Ok(Some(group))
    }

    /// Replace the loaded groups with the stored ones.
    pub async fn load_all_groups(&self) -> Result<()> {
        let records = self.storage.load_all_groups().await?;
        let now = Utc::now();
        let mut names: Vec<String> = Vec::with_capacity(records.len());
        for record in &records {
            record.apply_to(&self.groups.get_or_make(&record.name), now);
            names.push(record.name.clone());
        }
        self.groups.retain_names(&names);
        Ok(())
    }

    pub async fn save_group(&self, name: &str) -> Result<()> {
        let group = self.loaded_group(name)?;
        let _guard = group.store().io_lock().lock().await;
        self.storage
            .save_group(&GroupRecord::from_group(&group, Utc::now()))
            .await?;
        group.store().mark_clean();
        Ok(())
    }

    /// Delete a group from storage and memory.
    ///
    /// Deletion does not cascade: tracks that still list the group are
    /// returned as inconsistent references.
    #[instrument(skip(self, actor))]
    pub async fn delete_group(&self, actor: &Actor, name: &str) -> Result<Vec<PermsError>> {
        let name = validate_name(name)?;
        self.storage.delete_group(&name).await?;
        self.groups.unload(&name);
        self.audit(LogEntry::builder(actor.clone()).group(&name).action("delete"));

        let dangling: Vec<PermsError> = self
            .tracks
            .all()
            .iter()
            .filter(|t| t.contains_group(&name))
            .map(|t| PermsError::inconsistent_reference("track", t.name(), &name))
            .collect();
        for e in &dangling {
            e.log();
            counter!(INCONSISTENT_REFERENCES, "referrer" => "track").increment(1);
        }
        Ok(dangling)
    }

    fn loaded_group(&self, name: &str) -> Result<Arc<Group>> {
        self.groups
            .get(name)
            .ok_or_else(|| PermsError::not_found("group", name.to_lowercase()))
    }

    async fn update_group<R>(&self, group: &Group, change: impl FnOnce(&Group) -> Result<R>) -> Result<R> {
        let _guard = group.store().io_lock().lock().await;
        let copy = Group::new(group.name());
        copy.store().replace_all(group.nodes().as_ref().clone());

        let outcome = change(&copy)?;
        let now = Utc::now();
        let record = GroupRecord::from_group(&copy, now);
        self.storage.save_group(&record).await?;
        record.apply_to(group, now);
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracks
    // ─────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, actor))]
    pub async fn create_track(&self, actor: &Actor, name: &str) -> Result<Arc<Track>> {
        let name = validate_name(name)?;
        let record = self.storage.create_and_load_track(&name).await?;
        let track = self.tracks.get_or_make(&name);
        record.apply_to(&track);
        self.audit(LogEntry::builder(actor.clone()).track(&name).action("create"));
        Ok(track)
    }

    pub async fn load_track(&self, name: &str) -> Result<Option<Arc<Track>>> {
        let name = validate_name(name)?;
        let Some(record) = self.storage.load_track(&name).await? else {
            return Ok(None);
        };
        let track = self.tracks.get_or_make(&record.name);
        record.apply_to(&track);
        Ok(Some(track))
    }

    pub async fn load_all_tracks(&self) -> Result<()> {
        let records = self.storage.load_all_tracks().await?;
        let mut names: Vec<String> = Vec::with_capacity(records.len());
        for record in &records {
            record.apply_to(&self.tracks.get_or_make(&record.name));
            names.push(record.name.clone());
        }
        self.tracks.retain_names(&names);
        Ok(())
    }

    pub async fn save_track(&self, name: &str) -> Result<()> {
        let track = self.loaded_track(name)?;
        let _guard = track.io_lock().lock().await;
        self.storage.save_track(&TrackRecord::from_track(&track)).await?;
        track.mark_clean();
        Ok(())
    }

    #[instrument(skip(self, actor))]
    pub async fn delete_track(&self, actor: &Actor, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        self.storage.delete_track(&name).await?;
        self.tracks.unload(&name);
        self.audit(LogEntry::builder(actor.clone()).track(&name).action("delete"));
        Ok(())
    }

    /// Append a loaded group to the end of a track.
    pub async fn track_append(&self, actor: &Actor, track: &str, group: &str) -> Result<()> {
        let track = self.loaded_track(track)?;
        let group = self.loaded_group(group)?;
        self.update_track(&track, |copy| copy.append_group(group.name())).await?;
        self.audit(
            LogEntry::builder(actor.clone())
                .track(track.name())
                .action(format!("append {}", group.name())),
        );
        Ok(())
    }

    /// Insert a loaded group at `position` (0-based).
    pub async fn track_insert(&self, actor: &Actor, track: &str, group: &str, position: usize) -> Result<()> {
        let track = self.loaded_track(track)?;
        let group = self.loaded_group(group)?;
        self.update_track(&track, |copy| copy.insert_group(group.name(), position))
            .await?;
        self.audit(
            LogEntry::builder(actor.clone())
                .track(track.name())
                .action(format!("insert {} {}", group.name(), position)),
        );
        Ok(())
    }

    /// Remove a group from a track. The group itself need not be loaded.
    pub async fn track_remove(&self, actor: &Actor, track: &str, group: &str) -> Result<()> {
        let track = self.loaded_track(track)?;
        let group = group.to_lowercase();
        self.update_track(&track, |copy| copy.remove_group(&group)).await?;
        self.audit(
            LogEntry::builder(actor.clone())
                .track(track.name())
                .action(format!("remove {}", group)),
        );
        Ok(())
    }

    fn loaded_track(&self, name: &str) -> Result<Arc<Track>> {
        self.tracks
            .get(name)
            .ok_or_else(|| PermsError::not_found("track", name.to_lowercase()))
    }

    async fn update_track<R>(&self, track: &Track, change: impl FnOnce(&Track) -> Result<R>) -> Result<R> {
        let _guard = track.io_lock().lock().await;
        let copy = Track::new(track.name());
        copy.apply_loaded(track.groups());

        let outcome = change(&copy)?;
        let record = TrackRecord::from_track(&copy);
        self.storage.save_track(&record).await?;
        record.apply_to(track);
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Nodes
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a node to a loaded holder and persist it.
    #[instrument(skip(self, actor), fields(node = %node))]
    pub async fn grant(&self, actor: &Actor, holder: &HolderId, node: Node) -> Result<()> {
        let action = format!("set {}", node.serialize());
        match holder {
            HolderId::User(uuid) => {
                let user = self.loaded_user(*uuid)?;
                self.update_user(&user, |copy| copy.set_permission(node)).await?;
                self.audit(user_entry(actor, &user).action(action));
            }
            HolderId::Group(name) => {
                let group = self.loaded_group(name)?;
                self.update_group(&group, |copy| copy.set_permission(node)).await?;
                self.audit(LogEntry::builder(actor.clone()).group(group.name()).action(action));
            }
        }
        Ok(())
    }

    /// Remove a node from a loaded holder and persist it. Returns the removed node.
    #[instrument(skip(self, actor), fields(node = %node))]
    pub async fn revoke(&self, actor: &Actor, holder: &HolderId, node: &Node) -> Result<Node> {
        let action = format!("unset {}", node.serialize());
        let removed = match holder {
            HolderId::User(uuid) => {
                let user = self.loaded_user(*uuid)?;
                let removed = self.update_user(&user, |copy| copy.unset_permission(node)).await?;
                self.audit(user_entry(actor, &user).action(action));
                removed
            }
            HolderId::Group(name) => {
                let group = self.loaded_group(name)?;
                let removed = self.update_group(&group, |copy| copy.unset_permission(node)).await?;
                self.audit(LogEntry::builder(actor.clone()).group(group.name()).action(action));
                removed
            }
        };
        Ok(removed)
    }

    /// Replace a group's weight. Zero removes the weight node.
    pub async fn set_group_weight(&self, actor: &Actor, name: &str, weight: i32) -> Result<()> {
        let group = self.loaded_group(name)?;
        self.update_group(&group, |copy| copy.set_weight(weight)).await?;
        self.audit(
            LogEntry::builder(actor.clone())
                .group(group.name())
                .action(format!("setweight {}", weight)),
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// The current query context set of a user.
    pub fn contexts_for(&self, uuid: Uuid) -> ContextSet {
        self.platform.contexts_for(uuid)
    }

    /// Cached resolution of a loaded user.
    pub fn result_for(&self, uuid: Uuid, contexts: &ContextSet) -> Option<Arc<ResolvedResult>> {
        let user = self.users.get(uuid)?;
        Some(user.cache().get_or_compute(&user, contexts, &self.engine))
    }

    /// Value of a permission for a loaded user. Unknown users are `Undefined`.
    pub fn check_permission(&self, uuid: Uuid, permission: &str, contexts: &ContextSet) -> Tristate {
        self.result_for(uuid, contexts)
            .map(|r| r.check(permission))
            .unwrap_or(Tristate::Undefined)
    }

    pub fn meta_for(&self, uuid: Uuid, contexts: &ContextSet) -> Option<MetaBundle> {
        self.result_for(uuid, contexts).map(|r| r.meta().clone())
    }

    /// Every reference from a loaded entity to a group that is not loaded.
    pub fn verify_references(&self) -> Vec<PermsError> {
        let mut errors: Vec<(&'static str, PermsError)> = Vec::new();
        let now = Utc::now();

        for track in self.tracks.all() {
            for group in track.groups() {
                if !self.groups.is_loaded(&group) {
                    errors.push(("track", PermsError::inconsistent_reference("track", track.name(), group)));
                }
            }
        }

        let referenced = |nodes: &[Node]| -> Vec<String> {
            let mut names: Vec<String> = nodes
                .iter()
                .filter(|n| !n.has_expired(now))
                .filter_map(|n| n.group_name().map(str::to_lowercase))
                .collect();
            names.sort();
            names.dedup();
            names
        };

        for group in self.groups.all() {
            for parent in referenced(group.nodes().as_slice()) {
                if !self.groups.is_loaded(&parent) {
                    errors.push(("group", PermsError::inconsistent_reference("group", group.name(), parent)));
                }
            }
        }

        for user in self.users.all() {
            let mut parents = referenced(user.nodes().as_slice());
            let primary = user.primary_group();
            if !parents.contains(&primary) {
                parents.push(primary);
            }
            for parent in parents {
                if !self.groups.is_loaded(&parent) {
                    errors.push((
                        "user",
                        PermsError::inconsistent_reference("user", user.uuid().to_string(), parent),
                    ));
                }
            }
        }

        if !errors.is_empty() {
            warn!(count = errors.len(), "Found inconsistent references");
        }
        errors
            .into_iter()
            .map(|(referrer, e)| {
                e.log();
                counter!(INCONSISTENT_REFERENCES, "referrer" => referrer).increment(1);
                e
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Promotion
    // ─────────────────────────────────────────────────────────────────────────

    /// Groups of `track` the user holds permanently with exactly `contexts`.
    fn groups_on_track(&self, user: &User, track: &Track, contexts: &ContextSet) -> Vec<String> {
        let mut held: Vec<String> = Vec::new();
        for node in user.nodes().iter() {
            if !node.value() || !node.is_permanent() || node.contexts() != contexts {
                continue;
            }
            if let Some(name) = node.group_name().map(str::to_lowercase) {
                if track.contains_group(&name) && !held.contains(&name) {
                    held.push(name);
                }
            }
        }
        held
    }

    fn single_group_on_track(&self, user: &User, track: &Track, contexts: &ContextSet) -> Result<Option<String>> {
        let mut held = self.groups_on_track(user, track, contexts);
        if held.len() > 1 {
            return Err(PermsError::already_has(
                "user",
                user.uuid().to_string(),
                format!("more than one group on track '{}': {}", track.name(), held.join(", ")),
            ));
        }
        Ok(held.pop())
    }

    /// Move a user one step up a track in `contexts`.
    ///
    /// A user on none of the track's groups is placed on the first one.
    #[instrument(skip(self, actor))]
    pub async fn promote(&self, actor: &Actor, uuid: Uuid, track: &str, contexts: &ContextSet) -> Result<TrackMove> {
        let user = self.loaded_user(uuid)?;
        let track = self.loaded_track(track)?;
        let current = self.single_group_on_track(&user, &track, contexts)?;

        let next = match &current {
            None => track
                .groups()
                .first()
                .cloned()
                .ok_or_else(|| PermsError::lacks("track", track.name(), "any group"))?,
            Some(current) => track.get_next(current)?.ok_or_else(|| {
                PermsError::lacks("track", track.name(), format!("a group after '{}'", current))
            })?,
        };
        self.loaded_group(&next)?;

        self.move_on_track(&user, current.as_deref(), &next, contexts).await?;
        let step = TrackMove {
            track: track.name().to_string(),
            from: current,
            to: next,
        };
        self.audit(user_entry(actor, &user).action(format!(
            "promote {}{} {} -> {}",
            track.name(),
            context_suffix(contexts),
            step.from.as_deref().unwrap_or("none"),
            step.to
        )));
        Ok(step)
    }

    /// Move a user one step down a track in `contexts`.
    #[instrument(skip(self, actor))]
    pub async fn demote(&self, actor: &Actor, uuid: Uuid, track: &str, contexts: &ContextSet) -> Result<TrackMove> {
        let user = self.loaded_user(uuid)?;
        let track = self.loaded_track(track)?;
        let current = self.single_group_on_track(&user, &track, contexts)?.ok_or_else(|| {
            PermsError::lacks("user", uuid.to_string(), format!("a group on track '{}'", track.name()))
        })?;

        let previous = track.get_previous(&current)?.ok_or_else(|| {
            PermsError::lacks("track", track.name(), format!("a group before '{}'", current))
        })?;
        self.loaded_group(&previous)?;

        self.move_on_track(&user, Some(&current), &previous, contexts).await?;
        let step = TrackMove {
            track: track.name().to_string(),
            from: Some(current),
            to: previous,
        };
        self.audit(user_entry(actor, &user).action(format!(
            "demote {}{} {} -> {}",
            track.name(),
            context_suffix(contexts),
            step.from.as_deref().unwrap_or("none"),
            step.to
        )));
        Ok(step)
    }

    async fn move_on_track(&self, user: &User, from: Option<&str>, to: &str, contexts: &ContextSet) -> Result<()> {
        self.update_user(user, |copy| {
            if let Some(from) = from {
                copy.unset_inherit_group(from, contexts, false)?;
            }
            copy.set_inherit_group(to, contexts, None)?;
            if from.is_some_and(|f| copy.primary_group() == f) {
                copy.force_primary_group(to);
            }
            Ok(())
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background work
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the cache refresher if `cache.refresh_interval` is set.
    pub fn start_cache_refresher(&self) -> Option<RefresherHandle> {
        let interval = self.config.cache.refresh_interval?;
        Some(CacheRefresher::new(self.users.clone(), self.engine.clone(), interval).start())
    }
}

fn user_entry(actor: &Actor, user: &User) -> crate::model::LogEntryBuilder {
    let name = user.username().unwrap_or_else(|| user.uuid().to_string());
    LogEntry::builder(actor.clone()).user(user.uuid(), name)
}

fn context_suffix(contexts: &ContextSet) -> String {
    if contexts.is_empty() {
        String::new()
    } else {
        format!(" {}", contexts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::MemoryBacking;
    use std::time::Duration;

    async fn service() -> PermissionService {
        let storage = Storage::new(Arc::new(MemoryBacking::new()), Duration::from_secs(5));
        let service = PermissionService::new(
            Config::default(),
            storage,
            Arc::new(StaticPlatformContext::new(Some("survival"), ContextSet::empty())),
        );
        service.load_all().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_new_user_gets_default_group() {
        let service = service().await;
        let uuid = Uuid::new_v4();
        let user = service.load_user(uuid, Some("Steve")).await.unwrap();

        assert_eq!(user.primary_group(), "default");
        assert!(user.inherits_group("default", &ContextSet::empty()));
        assert!(user.has_only_defaults("default"));
        assert_eq!(service.storage().get_uuid("steve").await.unwrap(), Some(uuid));
    }

    #[tokio::test]
    async fn test_grant_and_check() {
        let service = service().await;
        let uuid = Uuid::new_v4();
        service.load_user(uuid, None).await.unwrap();
        let actor = Actor::console();

        service
            .grant(&actor, &HolderId::Group("default".into()), Node::builder("kit.starter").build())
            .await
            .unwrap();
        service
            .grant(&actor, &HolderId::User(uuid), Node::builder("essentials.fly").server("survival").build())
            .await
            .unwrap();

        let contexts = service.contexts_for(uuid);
        assert_eq!(service.check_permission(uuid, "kit.starter", &contexts), Tristate::True);
        assert_eq!(service.check_permission(uuid, "essentials.fly", &contexts), Tristate::True);
        assert_eq!(
            service.check_permission(uuid, "essentials.fly", &ContextSet::empty()),
            Tristate::Undefined
        );
        assert_eq!(
            service.check_permission(Uuid::new_v4(), "kit.starter", &contexts),
            Tristate::Undefined
        );

        let duplicate = service
            .grant(&actor, &HolderId::User(uuid), Node::builder("essentials.fly").server("survival").build())
            .await;
        assert_eq!(duplicate.unwrap_err().code(), ErrorCode::ObjectAlreadyHas);

        let stored = service.storage().load_user(uuid).await.unwrap().unwrap();
        assert_eq!(stored.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_missing_node() {
        let service = service().await;
        let err = service
            .revoke(&Actor::console(), &HolderId::Group("default".into()), &Node::builder("nope").build())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ObjectLacks);

        let err = service
            .revoke(&Actor::console(), &HolderId::Group("ghost".into()), &Node::builder("nope").build())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_primary_group_rules() {
        let service = service().await;
        let actor = Actor::console();
        let uuid = Uuid::new_v4();
        service.load_user(uuid, None).await.unwrap();
        service.create_group(&actor, "vip").await.unwrap();

        let err = service.set_primary_group(&actor, uuid, "vip").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ObjectLacks);

        service
            .grant(&actor, &HolderId::User(uuid), Node::group("vip").build())
            .await
            .unwrap();
        service.set_primary_group(&actor, uuid, "vip").await.unwrap();
        assert_eq!(service.users().get(uuid).unwrap().primary_group(), "vip");
    }

    #[tokio::test]
    async fn test_invalid_group_name() {
        let service = service().await;
        let err = service.create_group(&Actor::console(), "no spaces").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidName);
    }

    #[tokio::test]
    async fn test_refresher_only_with_interval() {
        let service = service().await;
        assert!(service.start_cache_refresher().is_none());
    }
}
