//! Plain data exchanged with backings.
//!
//! Backings own no domain objects: they persist and return these records,
//! and the service applies them to the in-memory entities. Expired nodes are
//! dropped on the way in both directions.

use crate::model::{Group, Holder, Track, User};
use crate::node::Node;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn live(nodes: &[Node], now: DateTime<Utc>) -> Vec<Node> {
    nodes.iter().filter(|n| !n.has_expired(now)).cloned().collect()
}

/// Persisted form of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub primary_group: String,
    #[serde(default, with = "node_strings")]
    pub nodes: Vec<Node>,
}

impl UserRecord {
    pub fn new(uuid: Uuid, username: Option<String>, primary_group: &str) -> Self {
        Self {
            uuid,
            username,
            primary_group: primary_group.to_lowercase(),
            nodes: Vec::new(),
        }
    }

    pub fn from_user(user: &User, now: DateTime<Utc>) -> Self {
        Self {
            uuid: user.uuid(),
            username: user.username(),
            primary_group: user.primary_group(),
            nodes: live(&user.nodes(), now),
        }
    }

    pub fn apply_to(&self, user: &User, now: DateTime<Utc>) {
        user.apply_loaded(self.username.as_deref(), &self.primary_group, live(&self.nodes, now));
    }
}

/// Persisted form of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    #[serde(default, with = "node_strings")]
    pub nodes: Vec<Node>,
}

impl GroupRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            nodes: Vec::new(),
        }
    }

    pub fn from_group(group: &Group, now: DateTime<Utc>) -> Self {
        Self {
            name: group.name().to_string(),
            nodes: live(&group.nodes(), now),
        }
    }

    pub fn apply_to(&self, group: &Group, now: DateTime<Utc>) {
        group.store().replace_all(live(&self.nodes, now));
    }
}

/// Persisted form of a track: its name and ordered group names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl TrackRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            groups: Vec::new(),
        }
    }

    pub fn from_track(track: &Track) -> Self {
        Self {
            name: track.name().to_string(),
            groups: track.groups(),
        }
    }

    pub fn apply_to(&self, track: &Track) {
        track.apply_loaded(self.groups.clone());
    }
}

/// Nodes persisted as their serialized string form.
///
/// Decoding skips entries that do not parse; the rest of the holder loads.
pub(crate) mod node_strings {
    use crate::node::Node;
    use crate::telemetry::metrics::MALFORMED_NODES;
    use metrics::counter;
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::warn;

    pub fn serialize<S: Serializer>(nodes: &[Node], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(nodes.iter().map(Node::serialize))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Node>, D::Error> {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        Ok(raw
            .iter()
            .filter_map(|s| match Node::parse(s) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(node = %s, error = %e, "Skipping malformed stored node");
                    counter!(MALFORMED_NODES, "source" => "document").increment(1);
                    None
                }
            })
            .collect())
    }
}
