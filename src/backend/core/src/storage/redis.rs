//! Document backing over Redis.
//!
//! Each entity is one JSON document under `{prefix}{kind}:{id}`, with a set
//! per kind indexing the stored ids. The UUID cache is a pair of hashes and
//! the audit log a list.

use super::{Backing, GroupRecord, TrackRecord, UserRecord};
use crate::error::{PermsError, Result};
use crate::model::LogEntry;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backing storing JSON documents in Redis.
pub struct RedisBacking {
    client: redis::Client,
    prefix: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisBacking {
    /// Create the backing. No connection is made until first use.
    pub fn new(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| PermsError::configuration(format!("Invalid redis URL: {}", e)))?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| PermsError::storage_unavailable("redis", e.to_string()).with_source(e))
            })
            .await?;
        Ok(conn.clone())
    }

    fn key(&self, kind: &str, id: &str) -> String {
        format!("{}{}:{}", self.prefix, kind, id)
    }

    fn index(&self, kind: &str) -> String {
        format!("{}{}s", self.prefix, kind)
    }

    async fn get_doc<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a document and index it in one transaction.
    async fn put_doc<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.key(kind, id))
            .arg(encoded)
            .ignore()
            .cmd("SADD")
            .arg(self.index(kind))
            .arg(id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Store `value` only if no document exists, then return whichever is stored.
    async fn create_doc<T: Serialize + DeserializeOwned>(&self, kind: &str, id: &str, value: T) -> Result<T> {
        let encoded = serde_json::to_string(&value)?;
        let key = self.key(kind, id);
        let mut conn = self.conn().await?;
        let (stored,): (Option<String>,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&key)
            .arg(encoded)
            .arg("NX")
            .ignore()
            .cmd("SADD")
            .arg(self.index(kind))
            .arg(id)
            .ignore()
            .cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        match stored {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(value),
        }
    }

    async fn delete_doc(&self, kind: &str, id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.key(kind, id))
            .ignore()
            .cmd("SREM")
            .arg(self.index(kind))
            .arg(id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ids(&self, kind: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index(kind))
            .query_async(&mut conn)
            .await?;
        ids.sort();
        Ok(ids)
    }

    async fn all_docs<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let mut docs = Vec::new();
        for id in self.ids(kind).await? {
            match self.get_doc(&self.key(kind, &id)).await {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => debug!(kind, id = %id, "Index entry without document"),
                Err(e) => warn!(kind, id = %id, error = %e, "Skipping unreadable document"),
            }
        }
        Ok(docs)
    }
}

#[async_trait]
impl Backing for RedisBacking {
    fn name(&self) -> &str {
        "redis"
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(prefix = %self.prefix, "Redis storage ready");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn log_action(&self, entry: &LogEntry) -> Result<()> {
        let encoded = serde_json::to_string(entry)?;
        let mut conn = self.conn().await?;
        redis::cmd("RPUSH")
            .arg(format!("{}log", self.prefix))
            .arg(encoded)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_log(&self) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(format!("{}log", self.prefix))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let mut entries = Vec::with_capacity(raw.len());
        for line in raw {
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping unreadable log entry"),
            }
        }
        Ok(entries)
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        self.get_doc(&self.key("user", &uuid.to_string())).await
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.put_doc("user", &user.uuid.to_string(), user).await
    }

    async fn get_unique_users(&self) -> Result<Vec<Uuid>> {
        let mut uuids: Vec<Uuid> = self
            .ids("user")
            .await?
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect();
        uuids.sort();
        Ok(uuids)
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()> {
        let username = username.to_lowercase();
        let by_name = format!("{}uuid:byname", self.prefix);
        let by_id = format!("{}uuid:byid", self.prefix);
        let mut conn = self.conn().await?;

        let previous: Option<String> = redis::cmd("HGET")
            .arg(&by_id)
            .arg(uuid.to_string())
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(old) = previous.filter(|old| *old != username) {
            pipe.cmd("HDEL").arg(&by_name).arg(old).ignore();
        }
        pipe.cmd("HSET")
            .arg(&by_name)
            .arg(&username)
            .arg(uuid.to_string())
            .ignore()
            .cmd("HSET")
            .arg(&by_id)
            .arg(uuid.to_string())
            .arg(&username)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("HGET")
            .arg(format!("{}uuid:byname", self.prefix))
            .arg(username.to_lowercase())
            .query_async(&mut conn)
            .await?;
        Ok(raw.and_then(|r| Uuid::parse_str(&r).ok()))
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let name: Option<String> = redis::cmd("HGET")
            .arg(format!("{}uuid:byid", self.prefix))
            .arg(uuid.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(name)
    }

    async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord> {
        let record = GroupRecord::new(name);
        let id = record.name.clone();
        self.create_doc("group", &id, record).await
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        self.get_doc(&self.key("group", &name.to_lowercase())).await
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        self.all_docs("group").await
    }

    async fn save_group(&self, group: &GroupRecord) -> Result<()> {
        self.put_doc("group", &group.name, group).await
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        self.delete_doc("group", &name.to_lowercase()).await
    }

    async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord> {
        let record = TrackRecord::new(name);
        let id = record.name.clone();
        self.create_doc("track", &id, record).await
    }

    async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>> {
        self.get_doc(&self.key("track", &name.to_lowercase())).await
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>> {
        self.all_docs("track").await
    }

    async fn save_track(&self, track: &TrackRecord) -> Result<()> {
        self.put_doc("track", &track.name, track).await
    }

    async fn delete_track(&self, name: &str) -> Result<()> {
        self.delete_doc("track", &name.to_lowercase()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_key_layout() {
        let backing = RedisBacking::new("redis://127.0.0.1:6379", "permstack:").unwrap();
        assert_eq!(backing.key("group", "admin"), "permstack:group:admin");
        assert_eq!(backing.index("track"), "permstack:tracks");
    }

    #[test]
    fn test_invalid_url() {
        let err = RedisBacking::new("not a url", "p:").err().unwrap();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let backing = RedisBacking::new("redis://127.0.0.1:1", "p:").unwrap();
        let err = backing.init().await.unwrap_err();
        assert!(err.code().is_retryable());
    }
}
