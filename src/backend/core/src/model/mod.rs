//! Domain entities: users, groups, tracks and their in-memory managers.

mod group;
mod holder;
mod log;
mod manager;
mod track;
mod user;

pub use group::Group;
pub use holder::{Holder, HolderType, NodeStore};
pub use log::{Actor, LogEntry, LogEntryBuilder, LogTarget};
pub use manager::{GroupManager, TrackManager, UserManager};
pub use track::Track;
pub use user::User;

use crate::error::{PermsError, Result};

/// Longest accepted group or track name.
pub const MAX_NAME_LENGTH: usize = 36;

/// Validate and lower-case a group or track name.
///
/// Names are ASCII letters, digits, `_` and `-`.
pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_NAME_LENGTH
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(trimmed.to_lowercase())
    } else {
        Err(PermsError::invalid_name(name))
    }
}
