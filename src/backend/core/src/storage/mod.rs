//! Storage: the asynchronous persistence contract and its backings.
//!
//! A [`Backing`] persists records against one storage technology. The
//! [`Storage`] facade wraps the configured backing (possibly a
//! [`SplitBacking`]) with timeouts, metrics and fire-and-forget audit logging.
//!
//! Every backing guarantees read-your-writes for its own instance, atomic
//! create (a half-written entity is never visible) and idempotent delete.

mod facade;
mod factory;
mod file;
mod memory;
mod records;
mod redis;
mod split;
mod sql;

pub use facade::Storage;
pub use factory::StorageFactory;
pub use file::{FileFormat, FlatFileBacking, JsonFormat, YamlFormat};
pub use memory::MemoryBacking;
pub use records::{GroupRecord, TrackRecord, UserRecord};
pub use self::redis::RedisBacking;
pub use split::SplitBacking;
pub use sql::SqlBacking;

use crate::error::Result;
use crate::model::LogEntry;
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Storage Types
// ═══════════════════════════════════════════════════════════════════════════════

/// A concrete storage technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageType {
    Json,
    Yaml,
    Sqlite,
    Postgres,
    Redis,
    Memory,
}

impl StorageType {
    /// Parse a configured method name, case-insensitively.
    pub fn parse(method: &str) -> Option<Self> {
        match method.trim().to_lowercase().as_str() {
            "json" | "flatfile" => Some(StorageType::Json),
            "yaml" | "yml" => Some(StorageType::Yaml),
            "sqlite" => Some(StorageType::Sqlite),
            "postgresql" | "postgres" => Some(StorageType::Postgres),
            "redis" => Some(StorageType::Redis),
            "memory" => Some(StorageType::Memory),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageType::Json => "json",
            StorageType::Yaml => "yaml",
            StorageType::Sqlite => "sqlite",
            StorageType::Postgres => "postgresql",
            StorageType::Redis => "redis",
            StorageType::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entity kinds that split storage can route independently.
pub const SPLIT_KEYS: [&str; 5] = ["user", "group", "track", "uuid", "log"];

// ═══════════════════════════════════════════════════════════════════════════════
// Backing Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// One storage technology implementing the persistence contract.
#[async_trait]
pub trait Backing: Send + Sync {
    /// Identifier used in logs and metrics.
    fn name(&self) -> &str;

    async fn init(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    // ─── Audit log ──────────────────────────────────────────────────────────

    async fn log_action(&self, entry: &LogEntry) -> Result<()>;

    /// Every entry, oldest first.
    async fn get_log(&self) -> Result<Vec<LogEntry>>;

    // ─── Users ──────────────────────────────────────────────────────────────

    /// The stored user, or `None` if it was never saved.
    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>>;

    async fn save_user(&self, user: &UserRecord) -> Result<()>;

    async fn get_unique_users(&self) -> Result<Vec<Uuid>>;

    // ─── UUID cache ─────────────────────────────────────────────────────────

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()>;

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>>;

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>>;

    // ─── Groups ─────────────────────────────────────────────────────────────

    /// Load the group, creating an empty one first if it does not exist.
    async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord>;

    async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>>;

    async fn load_all_groups(&self) -> Result<Vec<GroupRecord>>;

    async fn save_group(&self, group: &GroupRecord) -> Result<()>;

    /// Deleting an absent group succeeds.
    async fn delete_group(&self, name: &str) -> Result<()>;

    // ─── Tracks ─────────────────────────────────────────────────────────────

    /// Load the track, creating an empty one first if it does not exist.
    async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord>;

    async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>>;

    async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>>;

    async fn save_track(&self, track: &TrackRecord) -> Result<()>;

    /// Deleting an absent track succeeds.
    async fn delete_track(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_methods() {
        assert_eq!(StorageType::parse("FlatFile"), Some(StorageType::Json));
        assert_eq!(StorageType::parse("yml"), Some(StorageType::Yaml));
        assert_eq!(StorageType::parse(" postgres "), Some(StorageType::Postgres));
        assert_eq!(StorageType::parse("PostgreSQL"), Some(StorageType::Postgres));
        assert_eq!(StorageType::parse("mongodb"), None);
        assert_eq!(StorageType::Sqlite.to_string(), "sqlite");
    }
}
