//! Audit log entries.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who performed an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub uuid: Uuid,
    pub name: String,
}

impl Actor {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
        }
    }

    /// The process itself: nil UUID, name `console`.
    pub fn console() -> Self {
        Self::new(Uuid::nil(), "console")
    }
}

/// Kind of entity an action was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    User,
    Group,
    Track,
}

impl LogTarget {
    pub fn as_char(&self) -> char {
        match self {
            LogTarget::User => 'U',
            LogTarget::Group => 'G',
            LogTarget::Track => 'T',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'U' => Some(LogTarget::User),
            'G' => Some(LogTarget::Group),
            'T' => Some(LogTarget::Track),
            _ => None,
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub target_type: LogTarget,
    /// UUID of a user target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_uuid: Option<Uuid>,
    /// Username, group name or track name
    pub target_name: String,
    pub action: String,
}

impl LogEntry {
    pub fn builder(actor: Actor) -> LogEntryBuilder {
        LogEntryBuilder {
            actor,
            timestamp: None,
            target: None,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}) [{}] {}: {}",
            self.actor.name,
            self.target_type.as_char(),
            self.target_name,
            self.action
        )
    }
}

/// Builder for [`LogEntry`].
#[derive(Debug, Clone)]
pub struct LogEntryBuilder {
    actor: Actor,
    timestamp: Option<DateTime<Utc>>,
    target: Option<(LogTarget, Option<Uuid>, String)>,
}

impl LogEntryBuilder {
    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    pub fn user(mut self, uuid: Uuid, name: impl Into<String>) -> Self {
        self.target = Some((LogTarget::User, Some(uuid), name.into()));
        self
    }

    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.target = Some((LogTarget::Group, None, name.into()));
        self
    }

    pub fn track(mut self, name: impl Into<String>) -> Self {
        self.target = Some((LogTarget::Track, None, name.into()));
        self
    }

    /// Finish with the action description.
    ///
    /// Entries without a target are recorded against the actor.
    pub fn action(self, action: impl Into<String>) -> LogEntry {
        let now = self.timestamp.unwrap_or_else(Utc::now);
        let timestamp = Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now);
        let (target_type, target_uuid, target_name) = self
            .target
            .unwrap_or((LogTarget::User, Some(self.actor.uuid), self.actor.name.clone()));
        LogEntry {
            timestamp,
            actor: self.actor,
            target_type,
            target_uuid,
            target_name,
            action: action.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_entry() {
        let entry = LogEntry::builder(Actor::console()).track("staff").action("append mod");
        assert_eq!(entry.target_type, LogTarget::Track);
        assert_eq!(entry.to_string(), "(console) [T] staff: append mod");
        assert_eq!(entry.timestamp.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_untargeted_entry_points_at_actor() {
        let actor = Actor::new(Uuid::new_v4(), "admin");
        let entry = LogEntry::builder(actor.clone()).action("reload");
        assert_eq!(entry.target_uuid, Some(actor.uuid));
        assert_eq!(entry.target_name, "admin");
    }

    #[test]
    fn test_target_chars() {
        for t in [LogTarget::User, LogTarget::Group, LogTarget::Track] {
            assert_eq!(LogTarget::from_char(t.as_char()), Some(t));
        }
        assert_eq!(LogTarget::from_char('x'), None);
    }
}
