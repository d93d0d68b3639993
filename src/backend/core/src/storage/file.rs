//! Flat-file backings: one document per entity.
//!
//! Layout under the data directory:
//!
//! ```text
//! <format>-storage/
//!   users/<uuid>.<ext>
//!   groups/<name>.<ext>
//!   tracks/<name>.<ext>
//!   uuidcache.<ext>
//!   actions.log          one JSON entry per line
//! ```
//!
//! Documents are written to a temporary sibling and renamed into place, so a
//! reader never sees a partial file.

use super::{Backing, GroupRecord, TrackRecord, UserRecord};
use crate::error::{PermsError, Result};
use crate::model::LogEntry;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Formats
// ═══════════════════════════════════════════════════════════════════════════════

/// Document encoding of a flat-file backing.
pub trait FileFormat: Send + Sync + 'static {
    /// Backing name and directory prefix.
    const NAME: &'static str;

    const EXTENSION: &'static str;

    fn encode<T: Serialize>(value: &T) -> Result<String>;

    fn decode<T: DeserializeOwned>(raw: &str) -> Result<T>;
}

/// Pretty-printed JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl FileFormat for JsonFormat {
    const NAME: &'static str = "json";
    const EXTENSION: &'static str = "json";

    fn encode<T: Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(value)?)
    }

    fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// YAML documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlFormat;

impl FileFormat for YamlFormat {
    const NAME: &'static str = "yaml";
    const EXTENSION: &'static str = "yml";

    fn encode<T: Serialize>(value: &T) -> Result<String> {
        Ok(serde_yaml::to_string(value)?)
    }

    fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Flat-File Backing
// ═══════════════════════════════════════════════════════════════════════════════

/// Backing storing each entity as a document in the chosen format.
pub struct FlatFileBacking<F: FileFormat> {
    root: PathBuf,
    write_lock: Mutex<()>,
    _format: PhantomData<F>,
}

impl<F: FileFormat> FlatFileBacking<F> {
    /// A backing rooted at `<data_directory>/<format>-storage`.
    pub fn new(data_directory: impl AsRef<Path>) -> Self {
        Self {
            root: data_directory.as_ref().join(format!("{}-storage", F::NAME)),
            write_lock: Mutex::new(()),
            _format: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    fn groups_dir(&self) -> PathBuf {
        self.root.join("groups")
    }

    fn tracks_dir(&self) -> PathBuf {
        self.root.join("tracks")
    }

    /// Path of the document for `id` inside `dir`.
    ///
    /// An id that could name a file outside `dir` is rejected.
    fn document(dir: PathBuf, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(PermsError::invalid_name(id).with_context("backing", F::NAME));
        }
        Ok(dir.join(format!("{}.{}", id, F::EXTENSION)))
    }

    fn uuid_cache_path(&self) -> PathBuf {
        self.root.join(format!("uuidcache.{}", F::EXTENSION))
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("actions.log")
    }

    async fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => F::decode(&raw)
                .map(Some)
                .map_err(|e| e.with_context("path", path.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let encoded = F::encode(value)?;
        let tmp = path.with_extension(format!("{}.tmp", F::EXTENSION));
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Wrote document");
        Ok(())
    }

    async fn remove(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every decodable document in `dir`. Unreadable documents are skipped with a warning.
    async fn read_all<T: DeserializeOwned>(dir: PathBuf) -> Result<Vec<T>> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(F::EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
            }
        }
        Ok(records)
    }

    async fn uuid_cache(&self) -> Result<BTreeMap<String, Uuid>> {
        Ok(Self::read(&self.uuid_cache_path()).await?.unwrap_or_default())
    }
}

#[async_trait]
impl<F: FileFormat> Backing for FlatFileBacking<F> {
    fn name(&self) -> &str {
        F::NAME
    }

    async fn init(&self) -> Result<()> {
        for dir in [self.users_dir(), self.groups_dir(), self.tracks_dir()] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                PermsError::storage_unavailable(F::NAME, format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        debug!(root = %self.root.display(), "Flat-file storage ready");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        // waits for an in-flight write
        let _guard = self.write_lock.lock().await;
        Ok(())
    }

    async fn log_action(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn get_log(&self) -> Result<Vec<LogEntry>> {
        let raw = match tokio::fs::read_to_string(self.log_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping unreadable log line"),
            }
        }
        Ok(entries)
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        Self::read(&Self::document(self.users_dir(), &uuid.to_string())?).await
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::write(&Self::document(self.users_dir(), &user.uuid.to_string())?, user).await
    }

    async fn get_unique_users(&self) -> Result<Vec<Uuid>> {
        let mut uuids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.users_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(F::EXTENSION) {
                continue;
            }
            if let Some(uuid) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                uuids.push(uuid);
            }
        }
        uuids.sort();
        Ok(uuids)
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut cache = self.uuid_cache().await?;
        // one name per uuid
        cache.retain(|_, v| *v != uuid);
        cache.insert(username.to_lowercase(), uuid);
        Self::write(&self.uuid_cache_path(), &cache).await
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>> {
        Ok(self.uuid_cache().await?.get(&username.to_lowercase()).copied())
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>> {
        Ok(self
            .uuid_cache()
            .await?
            .into_iter()
            .find(|(_, v)| *v == uuid)
            .map(|(k, _)| k))
    }

    async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord> {
        let path = Self::document(self.groups_dir(), &name.to_lowercase())?;
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = Self::read(&path).await? {
            return Ok(existing);
        }
        let record = GroupRecord::new(name);
        Self::write(&path, &record).await?;
        Ok(record)
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        Self::read(&Self::document(self.groups_dir(), &name.to_lowercase())?).await
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        Self::read_all(self.groups_dir()).await
    }

    async fn save_group(&self, group: &GroupRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::write(&Self::document(self.groups_dir(), &group.name)?, group).await
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::remove(&Self::document(self.groups_dir(), &name.to_lowercase())?).await
    }

    async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord> {
        let path = Self::document(self.tracks_dir(), &name.to_lowercase())?;
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = Self::read(&path).await? {
            return Ok(existing);
        }
        let record = TrackRecord::new(name);
        Self::write(&path, &record).await?;
        Ok(record)
    }

    async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>> {
        Self::read(&Self::document(self.tracks_dir(), &name.to_lowercase())?).await
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>> {
        Self::read_all(self.tracks_dir()).await
    }

    async fn save_track(&self, track: &TrackRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::write(&Self::document(self.tracks_dir(), &track.name)?, track).await
    }

    async fn delete_track(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::remove(&Self::document(self.tracks_dir(), &name.to_lowercase())?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::model::Actor;
    use crate::node::Node;
    use tempfile::TempDir;

    async fn backing<F: FileFormat>(dir: &TempDir) -> FlatFileBacking<F> {
        let backing = FlatFileBacking::<F>::new(dir.path());
        backing.init().await.unwrap();
        backing
    }

    #[tokio::test]
    async fn test_json_layout() {
        let dir = TempDir::new().unwrap();
        let backing = backing::<JsonFormat>(&dir).await;
        backing.create_and_load_group("Admin").await.unwrap();

        let path = dir.path().join("json-storage/groups/admin.json");
        assert!(path.exists());
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("\"name\": \"admin\""));
    }

    #[tokio::test]
    async fn test_yaml_user_round_trip() {
        let dir = TempDir::new().unwrap();
        let backing = backing::<YamlFormat>(&dir).await;
        let mut user = UserRecord::new(Uuid::new_v4(), Some("steve".into()), "default");
        user.nodes.push(Node::builder("essentials.fly").world("nether").build());
        backing.save_user(&user).await.unwrap();

        assert_eq!(backing.load_user(user.uuid).await.unwrap(), Some(user.clone()));
        assert_eq!(backing.get_unique_users().await.unwrap(), vec![user.uuid]);
        assert!(backing.load_user(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let backing = backing::<JsonFormat>(&dir).await;
        let mut track = backing.create_and_load_track("staff").await.unwrap();
        track.groups = vec!["mod".into(), "admin".into()];
        backing.save_track(&track).await.unwrap();

        let again = backing.create_and_load_track("staff").await.unwrap();
        assert_eq!(again.groups, vec!["mod", "admin"]);

        backing.delete_track("staff").await.unwrap();
        backing.delete_track("staff").await.unwrap();
        assert!(backing.load_all_tracks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let backing = backing::<JsonFormat>(&dir).await;
        std::fs::write(dir.path().join("json-storage/groups/broken.json"), "{ nope").unwrap();
        backing.create_and_load_group("fine").await.unwrap();

        let err = backing.load_group("broken").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeserializationError);

        let all = backing.load_all_groups().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "fine");
    }

    #[tokio::test]
    async fn test_ids_stay_inside_their_folder() {
        let dir = TempDir::new().unwrap();
        let backing = backing::<JsonFormat>(&dir).await;
        backing.create_and_load_track("staff").await.unwrap();

        for id in ["../tracks/staff", "..", "a/b", "a\\b", ""] {
            let err = backing.delete_group(id).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidName, "{}", id);
            let err = backing.load_track(id).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidName, "{}", id);
        }
        assert!(dir.path().join("json-storage/tracks/staff.json").exists());
        assert!(backing.load_track("staff").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_uuid_cache_renames() {
        let dir = TempDir::new().unwrap();
        let backing = backing::<YamlFormat>(&dir).await;
        let uuid = Uuid::new_v4();
        backing.save_uuid_data("Old", uuid).await.unwrap();
        backing.save_uuid_data("New", uuid).await.unwrap();

        assert_eq!(backing.get_uuid("old").await.unwrap(), None);
        assert_eq!(backing.get_uuid("NEW").await.unwrap(), Some(uuid));
        assert_eq!(backing.get_name(uuid).await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_action_log_appends() {
        let dir = TempDir::new().unwrap();
        let backing = backing::<JsonFormat>(&dir).await;
        assert!(backing.get_log().await.unwrap().is_empty());

        let first = LogEntry::builder(Actor::console()).group("admin").action("create");
        let second = LogEntry::builder(Actor::console()).track("staff").action("append admin");
        backing.log_action(&first).await.unwrap();
        backing.log_action(&second).await.unwrap();

        assert_eq!(backing.get_log().await.unwrap(), vec![first, second]);
    }
}
