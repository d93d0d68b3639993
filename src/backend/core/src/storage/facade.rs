use super::{Backing, GroupRecord, TrackRecord, UserRecord};
use crate::error::{ErrorCode, Result};
use crate::model::LogEntry;
use crate::telemetry::metrics::STORAGE_OPERATIONS;
use metrics::counter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Front door to the configured backing.
///
/// Every call is bounded by the operation timeout and counted by outcome.
/// Failures are logged here and returned unchanged to the caller.
#[derive(Clone)]
pub struct Storage {
    backing: Arc<dyn Backing>,
    timeout: Duration,
}

impl Storage {
    pub fn new(backing: Arc<dyn Backing>, timeout: Duration) -> Self {
        Self { backing, timeout }
    }

    pub fn backing(&self) -> &Arc<dyn Backing> {
        &self.backing
    }

    pub fn name(&self) -> &str {
        self.backing.name()
    }

    async fn run<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(elapsed) => Err(crate::error::PermsError::from(elapsed)),
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if e.code() == ErrorCode::StorageTimeout => "timeout",
            Err(_) => "failure",
        };
        counter!(
            STORAGE_OPERATIONS,
            "backing" => self.backing.name().to_string(),
            "operation" => operation,
            "outcome" => outcome
        )
        .increment(1);

        result.map_err(|e| {
            let e = e.with_context("operation", operation);
            e.log();
            e
        })
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn init(&self) -> Result<()> {
        self.run("init", self.backing.init()).await
    }

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn shutdown(&self) -> Result<()> {
        self.run("shutdown", self.backing.shutdown()).await
    }

    // ─── Audit log ──────────────────────────────────────────────────────────

    pub async fn log_action(&self, entry: &LogEntry) -> Result<()> {
        self.run("log_action", self.backing.log_action(entry)).await
    }

    /// Record an entry in the background. Failure is logged, never returned.
    pub fn submit_log(&self, entry: LogEntry) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            if let Err(e) = storage.log_action(&entry).await {
                warn!(entry = %entry, error = %e, "Failed to record audit log entry");
            }
        })
    }

    pub async fn get_log(&self) -> Result<Vec<LogEntry>> {
        self.run("get_log", self.backing.get_log()).await
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        self.run("load_user", self.backing.load_user(uuid)).await
    }

    #[instrument(skip(self, user), fields(backing = %self.backing.name(), user = %user.uuid))]
    pub async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.run("save_user", self.backing.save_user(user)).await
    }

    pub async fn get_unique_users(&self) -> Result<Vec<Uuid>> {
        self.run("get_unique_users", self.backing.get_unique_users()).await
    }

    // ─── UUID cache ─────────────────────────────────────────────────────────

    pub async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()> {
        self.run("save_uuid_data", self.backing.save_uuid_data(username, uuid)).await
    }

    pub async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>> {
        self.run("get_uuid", self.backing.get_uuid(username)).await
    }

    pub async fn get_name(&self, uuid: Uuid) -> Result<Option<String>> {
        self.run("get_name", self.backing.get_name(uuid)).await
    }

    // ─── Groups ─────────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord> {
        self.run("create_and_load_group", self.backing.create_and_load_group(name)).await
    }

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        self.run("load_group", self.backing.load_group(name)).await
    }

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        self.run("load_all_groups", self.backing.load_all_groups()).await
    }

    #[instrument(skip(self, group), fields(backing = %self.backing.name(), group = %group.name))]
    pub async fn save_group(&self, group: &GroupRecord) -> Result<()> {
        self.run("save_group", self.backing.save_group(group)).await
    }

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn delete_group(&self, name: &str) -> Result<()> {
        self.run("delete_group", self.backing.delete_group(name)).await
    }

    // ─── Tracks ─────────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord> {
        self.run("create_and_load_track", self.backing.create_and_load_track(name)).await
    }

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>> {
        self.run("load_track", self.backing.load_track(name)).await
    }

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>> {
        self.run("load_all_tracks", self.backing.load_all_tracks()).await
    }

    #[instrument(skip(self, track), fields(backing = %self.backing.name(), track = %track.name))]
    pub async fn save_track(&self, track: &TrackRecord) -> Result<()> {
        self.run("save_track", self.backing.save_track(track)).await
    }

    #[instrument(skip(self), fields(backing = %self.backing.name()))]
    pub async fn delete_track(&self, name: &str) -> Result<()> {
        self.run("delete_track", self.backing.delete_track(name)).await
    }
}
