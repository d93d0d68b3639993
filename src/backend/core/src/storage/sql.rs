//! Relational backing over SQLite or PostgreSQL.
//!
//! Both engines go through the sqlx `Any` driver, so every statement sticks to
//! the common dialect: `$N` placeholders, `TEXT`/`BIGINT` columns and
//! `ON CONFLICT` upserts. Booleans and timestamps are stored as integers.

use super::{Backing, GroupRecord, StorageType, TrackRecord, UserRecord};
use crate::config::DatabaseConfig;
use crate::error::{PermsError, Result};
use crate::model::{Actor, LogEntry, LogTarget};
use crate::node::{ContextSet, Node};
use crate::telemetry::metrics::MALFORMED_NODES;
use async_trait::async_trait;
use metrics::counter;
use chrono::{TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fully prefixed table names.
#[derive(Debug, Clone)]
struct Tables {
    players: String,
    user_permissions: String,
    uuid_cache: String,
    groups: String,
    group_permissions: String,
    tracks: String,
    actions: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            players: format!("{}players", prefix),
            user_permissions: format!("{}user_permissions", prefix),
            uuid_cache: format!("{}uuid_cache", prefix),
            groups: format!("{}groups", prefix),
            group_permissions: format!("{}group_permissions", prefix),
            tracks: format!("{}tracks", prefix),
            actions: format!("{}actions", prefix),
        }
    }

    /// Table definitions, valid on both SQLite and PostgreSQL.
    ///
    /// Node rows keep every context, `server` and `world` included, in one
    /// `contexts` column holding the JSON form of the set, so arbitrary keys
    /// need no extra columns. Queries never filter on contexts.
    fn schema(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (uuid TEXT PRIMARY KEY, username TEXT, primary_group TEXT NOT NULL)",
                self.players
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (uuid TEXT NOT NULL, ordinal BIGINT NOT NULL, permission TEXT NOT NULL, \
                 value BIGINT NOT NULL, expiry BIGINT, contexts TEXT NOT NULL)",
                self.user_permissions
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_uuid ON {0} (uuid)",
                self.user_permissions
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (username TEXT PRIMARY KEY, uuid TEXT NOT NULL)",
                self.uuid_cache
            ),
            format!("CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY)", self.groups),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (name TEXT NOT NULL, ordinal BIGINT NOT NULL, permission TEXT NOT NULL, \
                 value BIGINT NOT NULL, expiry BIGINT, contexts TEXT NOT NULL)",
                self.group_permissions
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_name ON {0} (name)",
                self.group_permissions
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY, members TEXT NOT NULL)",
                self.tracks
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (seq BIGINT NOT NULL, logged_at BIGINT NOT NULL, actor_uuid TEXT NOT NULL, \
                 actor_name TEXT NOT NULL, target_type TEXT NOT NULL, target_uuid TEXT, target_name TEXT NOT NULL, \
                 action TEXT NOT NULL)",
                self.actions
            ),
        ]
    }
}

/// Backing storing entities in relational tables.
pub struct SqlBacking {
    kind: StorageType,
    pool: AnyPool,
    tables: Tables,
    next_seq: AtomicI64,
}

impl SqlBacking {
    /// Open a pool against `url` (`sqlite:` or `postgres://`).
    pub async fn connect(kind: StorageType, url: &str, config: &DatabaseConfig) -> Result<Self> {
        if !config
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(PermsError::configuration(format!(
                "Invalid table prefix '{}'",
                config.table_prefix
            )));
        }

        sqlx::any::install_default_drivers();

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = AnyPoolOptions::new().acquire_timeout(Duration::from_secs(5));
        options = if in_memory {
            // every connection of an in-memory SQLite database is a separate database
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
        };

        let pool = options
            .connect(url)
            .await
            .map_err(|e| PermsError::storage_unavailable(kind.name(), e.to_string()).with_source(e))?;

        Ok(Self {
            kind,
            pool,
            tables: Tables::new(&config.table_prefix),
            next_seq: AtomicI64::new(0),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn load_nodes(&self, table: &str, key_column: &str, key: &str) -> Result<Vec<Node>> {
        let sql = format!(
            "SELECT permission, value, expiry, contexts FROM {} WHERE {} = $1 ORDER BY ordinal",
            table, key_column
        );
        let rows = sqlx::query(&sql).bind(key).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .filter_map(|row| match node_from_row(row) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(table, holder = key, error = %e, "Skipping malformed stored node");
                    counter!(MALFORMED_NODES, "source" => "sql").increment(1);
                    None
                }
            })
            .collect())
    }

    async fn replace_nodes(
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        table: &str,
        key_column: &str,
        key: &str,
        nodes: &[Node],
    ) -> Result<()> {
        let delete = format!("DELETE FROM {} WHERE {} = $1", table, key_column);
        sqlx::query(&delete).bind(key).execute(&mut **tx).await?;

        let insert = format!(
            "INSERT INTO {} ({}, ordinal, permission, value, expiry, contexts) VALUES ($1, $2, $3, $4, $5, $6)",
            table, key_column
        );
        for (position, node) in nodes.iter().enumerate() {
            sqlx::query(&insert)
                .bind(key)
                .bind(position as i64)
                .bind(node.permission())
                .bind(node.value() as i64)
                .bind(node.expiry().map(|e| e.timestamp()))
                .bind(serde_json::to_string(node.contexts())?)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

fn node_from_row(row: &AnyRow) -> Result<Node> {
    let permission: String = row.try_get("permission")?;
    let value: i64 = row.try_get("value")?;
    let expiry: Option<i64> = row.try_get("expiry")?;
    let contexts: String = row.try_get("contexts")?;
    let contexts: ContextSet = serde_json::from_str(&contexts)?;

    let mut builder = Node::builder(permission)
        .value(value != 0)
        .with_contexts(&contexts);
    if let Some(seconds) = expiry {
        builder = builder.expiry_unix(seconds);
    }
    Ok(builder.build())
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        PermsError::with_internal(
            crate::error::ErrorCode::DeserializationError,
            "Stored UUID could not be decoded",
            e.to_string(),
        )
    })
}

#[async_trait]
impl Backing for SqlBacking {
    fn name(&self) -> &str {
        self.kind.name()
    }

    async fn init(&self) -> Result<()> {
        for statement in self.tables.schema() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        let sql = format!("SELECT COALESCE(MAX(seq), 0) AS seq FROM {}", self.tables.actions);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let last: i64 = row.try_get("seq")?;
        self.next_seq.store(last + 1, Ordering::SeqCst);

        info!(backing = self.kind.name(), "SQL storage schema ready");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn log_action(&self, entry: &LogEntry) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (seq, logged_at, actor_uuid, actor_name, target_type, target_uuid, target_name, action) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.tables.actions
        );
        sqlx::query(&sql)
            .bind(self.next_seq.fetch_add(1, Ordering::SeqCst))
            .bind(entry.timestamp.timestamp())
            .bind(entry.actor.uuid.to_string())
            .bind(&entry.actor.name)
            .bind(entry.target_type.as_char().to_string())
            .bind(entry.target_uuid.map(|u| u.to_string()))
            .bind(&entry.target_name)
            .bind(&entry.action)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_log(&self) -> Result<Vec<LogEntry>> {
        let sql = format!(
            "SELECT logged_at, actor_uuid, actor_name, target_type, target_uuid, target_name, action FROM {} ORDER BY logged_at, seq",
            self.tables.actions
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("target_type")?;
            let Some(target_type) = kind.chars().next().and_then(LogTarget::from_char) else {
                warn!(kind = %kind, "Skipping log entry with unknown target type");
                continue;
            };
            let logged_at: i64 = row.try_get("logged_at")?;
            let actor_uuid: String = row.try_get("actor_uuid")?;
            let target_uuid: Option<String> = row.try_get("target_uuid")?;

            entries.push(LogEntry {
                timestamp: Utc.timestamp_opt(logged_at, 0).single().unwrap_or_default(),
                actor: Actor::new(parse_uuid(&actor_uuid)?, row.try_get::<String, _>("actor_name")?),
                target_type,
                target_uuid: target_uuid.as_deref().map(parse_uuid).transpose()?,
                target_name: row.try_get("target_name")?,
                action: row.try_get("action")?,
            });
        }
        Ok(entries)
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        let sql = format!(
            "SELECT username, primary_group FROM {} WHERE uuid = $1",
            self.tables.players
        );
        let Some(row) = sqlx::query(&sql)
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let username: Option<String> = row.try_get("username")?;
        let primary_group: String = row.try_get("primary_group")?;
        let mut record = UserRecord::new(uuid, username, &primary_group);
        record.nodes = self
            .load_nodes(&self.tables.user_permissions, "uuid", &uuid.to_string())
            .await?;
        Ok(Some(record))
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        let uuid = user.uuid.to_string();
        let mut tx = self.pool.begin().await?;

        let upsert = format!(
            "INSERT INTO {} (uuid, username, primary_group) VALUES ($1, $2, $3) \
             ON CONFLICT (uuid) DO UPDATE SET username = excluded.username, primary_group = excluded.primary_group",
            self.tables.players
        );
        sqlx::query(&upsert)
            .bind(&uuid)
            .bind(user.username.clone())
            .bind(&user.primary_group)
            .execute(&mut *tx)
            .await?;
        Self::replace_nodes(&mut tx, &self.tables.user_permissions, "uuid", &uuid, &user.nodes).await?;

        tx.commit().await?;
        debug!(user = %user.uuid, nodes = user.nodes.len(), "Saved user");
        Ok(())
    }

    async fn get_unique_users(&self) -> Result<Vec<Uuid>> {
        let sql = format!("SELECT uuid FROM {} ORDER BY uuid", self.tables.players);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut uuids = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("uuid")?;
            match Uuid::parse_str(&raw) {
                Ok(uuid) => uuids.push(uuid),
                Err(_) => warn!(uuid = %raw, "Skipping user row with invalid UUID"),
            }
        }
        uuids.sort();
        Ok(uuids)
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let delete = format!("DELETE FROM {} WHERE uuid = $1", self.tables.uuid_cache);
        sqlx::query(&delete)
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await?;
        let upsert = format!(
            "INSERT INTO {} (username, uuid) VALUES ($1, $2) ON CONFLICT (username) DO UPDATE SET uuid = excluded.uuid",
            self.tables.uuid_cache
        );
        sqlx::query(&upsert)
            .bind(username.to_lowercase())
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>> {
        let sql = format!("SELECT uuid FROM {} WHERE username = $1", self.tables.uuid_cache);
        let row = sqlx::query(&sql)
            .bind(username.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(parse_uuid(&row.try_get::<String, _>("uuid")?)?)),
            None => Ok(None),
        }
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>> {
        let sql = format!("SELECT username FROM {} WHERE uuid = $1", self.tables.uuid_cache);
        let row = sqlx::query(&sql)
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<String, _>("username"))
            .transpose()
            .map_err(Into::into)
    }

    async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord> {
        let name = name.to_lowercase();
        let insert = format!(
            "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            self.tables.groups
        );
        sqlx::query(&insert).bind(&name).execute(&self.pool).await?;
        self.load_group(&name)
            .await?
            .ok_or_else(|| PermsError::internal(format!("group '{}' vanished after create", name)))
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        let name = name.to_lowercase();
        let sql = format!("SELECT name FROM {} WHERE name = $1", self.tables.groups);
        if sqlx::query(&sql)
            .bind(&name)
            .fetch_optional(&self.pool)
            .await?
            .is_none()
        {
            return Ok(None);
        }
        let mut record = GroupRecord::new(&name);
        record.nodes = self
            .load_nodes(&self.tables.group_permissions, "name", &name)
            .await?;
        Ok(Some(record))
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        let names_sql = format!("SELECT name FROM {} ORDER BY name", self.tables.groups);
        let mut groups: BTreeMap<String, GroupRecord> = BTreeMap::new();
        for row in sqlx::query(&names_sql).fetch_all(&self.pool).await? {
            let name: String = row.try_get("name")?;
            groups.insert(name.clone(), GroupRecord::new(&name));
        }

        let nodes_sql = format!(
            "SELECT name, permission, value, expiry, contexts FROM {} ORDER BY name, ordinal",
            self.tables.group_permissions
        );
        for row in sqlx::query(&nodes_sql).fetch_all(&self.pool).await? {
            let name: String = row.try_get("name")?;
            if let Some(group) = groups.get_mut(&name) {
                group.nodes.push(node_from_row(&row)?);
            }
        }
        Ok(groups.into_values().collect())
    }

    async fn save_group(&self, group: &GroupRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let insert = format!(
            "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            self.tables.groups
        );
        sqlx::query(&insert).bind(&group.name).execute(&mut *tx).await?;
        Self::replace_nodes(&mut tx, &self.tables.group_permissions, "name", &group.name, &group.nodes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();
        let mut tx = self.pool.begin().await?;
        for table in [&self.tables.group_permissions, &self.tables.groups] {
            let sql = format!("DELETE FROM {} WHERE name = $1", table);
            sqlx::query(&sql).bind(&name).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord> {
        let name = name.to_lowercase();
        let insert = format!(
            "INSERT INTO {} (name, members) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
            self.tables.tracks
        );
        sqlx::query(&insert)
            .bind(&name)
            .bind("[]")
            .execute(&self.pool)
            .await?;
        self.load_track(&name)
            .await?
            .ok_or_else(|| PermsError::internal(format!("track '{}' vanished after create", name)))
    }

    async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>> {
        let sql = format!("SELECT name, members FROM {} WHERE name = $1", self.tables.tracks);
        let row = sqlx::query(&sql)
            .bind(name.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(track_from_row).transpose()
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>> {
        let sql = format!("SELECT name, members FROM {} ORDER BY name", self.tables.tracks);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(track_from_row).collect()
    }

    async fn save_track(&self, track: &TrackRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (name, members) VALUES ($1, $2) ON CONFLICT (name) DO UPDATE SET members = excluded.members",
            self.tables.tracks
        );
        sqlx::query(&sql)
            .bind(&track.name)
            .bind(serde_json::to_string(&track.groups)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_track(&self, name: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE name = $1", self.tables.tracks);
        sqlx::query(&sql)
            .bind(name.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn track_from_row(row: &AnyRow) -> Result<TrackRecord> {
    let name: String = row.try_get("name")?;
    let groups: String = row.try_get("members")?;
    let mut record = TrackRecord::new(&name);
    record.groups = serde_json::from_str(&groups)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite() -> SqlBacking {
        let backing = SqlBacking::connect(StorageType::Sqlite, "sqlite::memory:", &DatabaseConfig::default())
            .await
            .unwrap();
        backing.init().await.unwrap();
        backing
    }

    #[tokio::test]
    async fn test_user_nodes_keep_order_and_fields() {
        let backing = sqlite().await;
        let mut user = UserRecord::new(Uuid::new_v4(), Some("alex".into()), "default");
        user.nodes.push(Node::builder("b.second").build());
        user.nodes.push(Node::builder("-a.first").server("survival").world("nether").build());
        user.nodes.push(Node::group("vip").expiry_unix(4_102_444_800).build());
        backing.save_user(&user).await.unwrap();

        let loaded = backing.load_user(user.uuid).await.unwrap().unwrap();
        assert_eq!(loaded, user);
        assert!(!loaded.nodes[1].value());

        user.nodes.truncate(1);
        backing.save_user(&user).await.unwrap();
        assert_eq!(backing.load_user(user.uuid).await.unwrap().unwrap().nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_groups_and_tracks() {
        let backing = sqlite().await;
        let mut admin = backing.create_and_load_group("Admin").await.unwrap();
        admin.nodes.push(Node::builder("*").build());
        backing.save_group(&admin).await.unwrap();
        backing.create_and_load_group("default").await.unwrap();

        // create never clobbers
        let again = backing.create_and_load_group("admin").await.unwrap();
        assert_eq!(again.nodes.len(), 1);

        let all = backing.load_all_groups().await.unwrap();
        assert_eq!(all.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(), vec!["admin", "default"]);

        backing.delete_group("admin").await.unwrap();
        backing.delete_group("admin").await.unwrap();
        assert!(backing.load_group("admin").await.unwrap().is_none());

        let mut track = backing.create_and_load_track("staff").await.unwrap();
        assert!(track.groups.is_empty());
        track.groups = vec!["mod".into(), "admin".into()];
        backing.save_track(&track).await.unwrap();
        assert_eq!(backing.load_track("staff").await.unwrap(), Some(track));
    }

    #[tokio::test]
    async fn test_log_and_uuid_cache() {
        let backing = sqlite().await;
        let uuid = Uuid::new_v4();
        backing.save_uuid_data("Steve", uuid).await.unwrap();
        backing.save_uuid_data("Steve2", uuid).await.unwrap();
        assert_eq!(backing.get_uuid("steve").await.unwrap(), None);
        assert_eq!(backing.get_name(uuid).await.unwrap().as_deref(), Some("steve2"));

        let first = LogEntry::builder(Actor::console()).user(uuid, "steve2").action("set a.b true");
        let second = LogEntry::builder(Actor::console()).group("admin").action("create");
        backing.log_action(&first).await.unwrap();
        backing.log_action(&second).await.unwrap();
        assert_eq!(backing.get_log().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_rejects_bad_prefix() {
        let config = DatabaseConfig {
            table_prefix: "perms; DROP".into(),
            ..DatabaseConfig::default()
        };
        let result = SqlBacking::connect(StorageType::Sqlite, "sqlite::memory:", &config).await;
        assert_eq!(
            result.err().map(|e| e.code()),
            Some(crate::error::ErrorCode::ConfigurationError)
        );
    }
}
