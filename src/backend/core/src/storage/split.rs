//! Routing of entity kinds to different backings.

use super::{Backing, GroupRecord, StorageType, TrackRecord, UserRecord};
use crate::error::{PermsError, Result};
use crate::model::LogEntry;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Backing that forwards each entity kind to its own backing.
///
/// Users, groups, tracks, the UUID cache and the audit log are routed
/// independently. Lifecycle calls reach every distinct backing exactly once.
pub struct SplitBacking {
    backings: BTreeMap<StorageType, Arc<dyn Backing>>,
    user: Arc<dyn Backing>,
    group: Arc<dyn Backing>,
    track: Arc<dyn Backing>,
    uuid: Arc<dyn Backing>,
    log: Arc<dyn Backing>,
}

impl SplitBacking {
    /// Build from the instantiated backings and a kind-to-type routing.
    ///
    /// Every kind must be routed to a type present in `backings`.
    pub fn new(
        backings: BTreeMap<StorageType, Arc<dyn Backing>>,
        routing: &HashMap<String, StorageType>,
    ) -> Result<Self> {
        let route = |kind: &str| -> Result<Arc<dyn Backing>> {
            let kind_type = routing
                .get(kind)
                .ok_or_else(|| PermsError::configuration(format!("No storage routed for '{}'", kind)))?;
            backings.get(kind_type).cloned().ok_or_else(|| {
                PermsError::configuration(format!(
                    "Storage '{}' routed for '{}' was not created",
                    kind_type, kind
                ))
            })
        };

        Ok(Self {
            user: route("user")?,
            group: route("group")?,
            track: route("track")?,
            uuid: route("uuid")?,
            log: route("log")?,
            backings,
        })
    }

    /// Distinct backings in use.
    pub fn backings(&self) -> impl Iterator<Item = (&StorageType, &Arc<dyn Backing>)> {
        self.backings.iter()
    }
}

#[async_trait]
impl Backing for SplitBacking {
    fn name(&self) -> &str {
        "split"
    }

    async fn init(&self) -> Result<()> {
        try_join_all(self.backings.values().map(|b| b.init())).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for (kind, backing) in &self.backings {
            if let Err(e) = backing.shutdown().await {
                tracing::warn!(backing = %kind, error = %e, "Backing failed to shut down");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn log_action(&self, entry: &LogEntry) -> Result<()> {
        self.log.log_action(entry).await
    }

    async fn get_log(&self) -> Result<Vec<LogEntry>> {
        self.log.get_log().await
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        self.user.load_user(uuid).await
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.user.save_user(user).await
    }

    async fn get_unique_users(&self) -> Result<Vec<Uuid>> {
        self.user.get_unique_users().await
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()> {
        self.uuid.save_uuid_data(username, uuid).await
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>> {
        self.uuid.get_uuid(username).await
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>> {
        self.uuid.get_name(uuid).await
    }

    async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord> {
        self.group.create_and_load_group(name).await
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        self.group.load_group(name).await
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        self.group.load_all_groups().await
    }

    async fn save_group(&self, group: &GroupRecord) -> Result<()> {
        self.group.save_group(group).await
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        self.group.delete_group(name).await
    }

    async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord> {
        self.track.create_and_load_track(name).await
    }

    async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>> {
        self.track.load_track(name).await
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>> {
        self.track.load_all_tracks().await
    }

    async fn save_track(&self, track: &TrackRecord) -> Result<()> {
        self.track.save_track(track).await
    }

    async fn delete_track(&self, name: &str) -> Result<()> {
        self.track.delete_track(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::{FlatFileBacking, JsonFormat, MemoryBacking};
    use tempfile::TempDir;

    fn routing(pairs: &[(&str, StorageType)]) -> HashMap<String, StorageType> {
        pairs.iter().map(|(k, t)| (k.to_string(), *t)).collect()
    }

    #[tokio::test]
    async fn test_routes_by_kind() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryBacking::new());
        let json = Arc::new(FlatFileBacking::<JsonFormat>::new(dir.path()));

        let mut backings: BTreeMap<StorageType, Arc<dyn Backing>> = BTreeMap::new();
        backings.insert(StorageType::Memory, memory.clone());
        backings.insert(StorageType::Json, json.clone());

        let split = SplitBacking::new(
            backings,
            &routing(&[
                ("user", StorageType::Memory),
                ("group", StorageType::Json),
                ("track", StorageType::Json),
                ("uuid", StorageType::Memory),
                ("log", StorageType::Json),
            ]),
        )
        .unwrap();
        split.init().await.unwrap();

        split.create_and_load_group("admin").await.unwrap();
        split
            .save_user(&UserRecord::new(Uuid::new_v4(), None, "default"))
            .await
            .unwrap();

        assert!(json.load_group("admin").await.unwrap().is_some());
        assert!(memory.load_group("admin").await.unwrap().is_none());
        assert_eq!(memory.get_unique_users().await.unwrap().len(), 1);
        assert!(json.get_unique_users().await.unwrap().is_empty());
        assert_eq!(split.backings().count(), 2);
    }

    #[test]
    fn test_missing_route_is_configuration_error() {
        let mut backings: BTreeMap<StorageType, Arc<dyn Backing>> = BTreeMap::new();
        backings.insert(StorageType::Memory, Arc::new(MemoryBacking::new()));
        let err = SplitBacking::new(backings, &routing(&[("user", StorageType::Memory)]))
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }
}
