//! Volatile backing kept entirely in process memory.

use super::{Backing, GroupRecord, TrackRecord, UserRecord};
use crate::error::Result;
use crate::model::LogEntry;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

/// In-memory backing. Used for tests and as a scratch store.
#[derive(Debug, Default)]
pub struct MemoryBacking {
    users: DashMap<Uuid, UserRecord>,
    groups: DashMap<String, GroupRecord>,
    tracks: DashMap<String, TrackRecord>,
    uuids: DashMap<String, Uuid>,
    log: Mutex<Vec<LogEntry>>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backing for MemoryBacking {
    fn name(&self) -> &str {
        "memory"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn log_action(&self, entry: &LogEntry) -> Result<()> {
        self.log.lock().push(entry.clone());
        Ok(())
    }

    async fn get_log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.lock().clone())
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.users.get(&uuid).map(|r| r.clone()))
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.users.insert(user.uuid, user.clone());
        Ok(())
    }

    async fn get_unique_users(&self) -> Result<Vec<Uuid>> {
        let mut uuids: Vec<Uuid> = self.users.iter().map(|e| *e.key()).collect();
        uuids.sort();
        Ok(uuids)
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()> {
        self.uuids.insert(username.to_lowercase(), uuid);
        Ok(())
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>> {
        Ok(self.uuids.get(&username.to_lowercase()).map(|u| *u))
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>> {
        Ok(self
            .uuids
            .iter()
            .find(|e| *e.value() == uuid)
            .map(|e| e.key().clone()))
    }

    async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord> {
        let record = self
            .groups
            .entry(name.to_lowercase())
            .or_insert_with(|| GroupRecord::new(name));
        Ok(record.clone())
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        Ok(self.groups.get(&name.to_lowercase()).map(|r| r.clone()))
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        let mut groups: Vec<GroupRecord> = self.groups.iter().map(|e| e.value().clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn save_group(&self, group: &GroupRecord) -> Result<()> {
        self.groups.insert(group.name.clone(), group.clone());
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        self.groups.remove(&name.to_lowercase());
        Ok(())
    }

    async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord> {
        let record = self
            .tracks
            .entry(name.to_lowercase())
            .or_insert_with(|| TrackRecord::new(name));
        Ok(record.clone())
    }

    async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>> {
        Ok(self.tracks.get(&name.to_lowercase()).map(|r| r.clone()))
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>> {
        let mut tracks: Vec<TrackRecord> = self.tracks.iter().map(|e| e.value().clone()).collect();
        tracks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tracks)
    }

    async fn save_track(&self, track: &TrackRecord) -> Result<()> {
        self.tracks.insert(track.name.clone(), track.clone());
        Ok(())
    }

    async fn delete_track(&self, name: &str) -> Result<()> {
        self.tracks.remove(&name.to_lowercase());
        Ok(())
    }
}
