//! In-memory arenas of loaded users, groups and tracks.
//!
//! Each manager exclusively owns its entities behind `Arc`s in a concurrent
//! map; callers mutate an entity through its own per-entity discipline.

use super::{Group, Track, User};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Groups
// ═══════════════════════════════════════════════════════════════════════════════

/// Loaded groups keyed by lower-case name.
///
/// Every mutation of a managed group, and every load or unload, advances the
/// manager epoch; cached resolutions stamped with an older epoch are stale.
#[derive(Debug, Default)]
pub struct GroupManager {
    groups: DashMap<String, Arc<Group>>,
    epoch: Arc<AtomicU64>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(&name.to_lowercase()).map(|g| g.value().clone())
    }

    /// The loaded group, or a fresh empty one registered under `name`.
    pub fn get_or_make(&self, name: &str) -> Arc<Group> {
        let key = name.to_lowercase();
        let mut created = false;
        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(Group::with_epoch(name, Some(self.epoch.clone())))
            })
            .value()
            .clone();
        if created {
            self.bump_epoch();
        }
        group
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.groups.contains_key(&name.to_lowercase())
    }

    pub fn unload(&self, name: &str) -> Option<Arc<Group>> {
        let removed = self.groups.remove(&name.to_lowercase()).map(|(_, g)| g);
        if removed.is_some() {
            self.bump_epoch();
        }
        removed
    }

    /// Drop every group not named in `keep`.
    pub fn retain_names(&self, keep: &[String]) {
        let before = self.groups.len();
        self.groups.retain(|name, _| keep.contains(name));
        if self.groups.len() != before {
            self.bump_epoch();
        }
    }

    pub fn all(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Users
// ═══════════════════════════════════════════════════════════════════════════════

/// Loaded users keyed by UUID.
#[derive(Debug)]
pub struct UserManager {
    users: DashMap<Uuid, Arc<User>>,
    default_group: String,
}

impl UserManager {
    pub fn new(default_group: &str) -> Self {
        Self {
            users: DashMap::new(),
            default_group: default_group.to_lowercase(),
        }
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<User>> {
        self.users.get(&uuid).map(|u| u.value().clone())
    }

    pub fn get_by_username(&self, username: &str) -> Option<Arc<User>> {
        self.users
            .iter()
            .find(|u| {
                u.value()
                    .username()
                    .map(|n| n.eq_ignore_ascii_case(username))
                    .unwrap_or(false)
            })
            .map(|u| u.value().clone())
    }

    /// The loaded user, or a fresh one with the default primary group.
    pub fn get_or_make(&self, uuid: Uuid, username: Option<&str>) -> Arc<User> {
        let user = self
            .users
            .entry(uuid)
            .or_insert_with(|| Arc::new(User::new(uuid, username, &self.default_group)))
            .value()
            .clone();
        if let Some(name) = username {
            user.set_username(name);
        }
        user
    }

    pub fn is_loaded(&self, uuid: Uuid) -> bool {
        self.users.contains_key(&uuid)
    }

    pub fn unload(&self, uuid: Uuid) -> Option<Arc<User>> {
        self.users.remove(&uuid).map(|(_, u)| u)
    }

    pub fn all(&self) -> Vec<Arc<User>> {
        self.users.iter().map(|u| u.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tracks
// ═══════════════════════════════════════════════════════════════════════════════

/// Loaded tracks keyed by lower-case name.
#[derive(Debug, Default)]
pub struct TrackManager {
    tracks: DashMap<String, Arc<Track>>,
}

impl TrackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.get(&name.to_lowercase()).map(|t| t.value().clone())
    }

    pub fn get_or_make(&self, name: &str) -> Arc<Track> {
        self.tracks
            .entry(name.to_lowercase())
            .or_insert_with(|| Arc::new(Track::new(name)))
            .value()
            .clone()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.tracks.contains_key(&name.to_lowercase())
    }

    pub fn unload(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.remove(&name.to_lowercase()).map(|(_, t)| t)
    }

    pub fn retain_names(&self, keep: &[String]) {
        self.tracks.retain(|name, _| keep.contains(name));
    }

    pub fn all(&self) -> Vec<Arc<Track>> {
        let mut tracks: Vec<Arc<Track>> = self.tracks.iter().map(|t| t.value().clone()).collect();
        tracks.sort_by(|a, b| a.name().cmp(b.name()));
        tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
