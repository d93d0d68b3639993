use crate::error::{PermsError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// An ordered, duplicate-free promotion ladder of group names.
///
/// Group names are stored lower-case. The track only holds names; whether a
/// named group still exists is the caller's concern.
#[derive(Debug)]
pub struct Track {
    name: String,
    groups: RwLock<Vec<String>>,
    dirty: AtomicBool,
    io_lock: tokio::sync::Mutex<()>,
}

impl Track {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            groups: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(false),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.read().clone()
    }

    pub fn size(&self) -> usize {
        self.groups.read().len()
    }

    pub fn contains_group(&self, group: &str) -> bool {
        self.index_of(group).is_some()
    }

    pub fn index_of(&self, group: &str) -> Option<usize> {
        let group = group.to_lowercase();
        self.groups.read().iter().position(|g| *g == group)
    }

    /// Append a group at the end.
    pub fn append_group(&self, group: &str) -> Result<()> {
        let group = group.to_lowercase();
        let mut groups = self.groups.write();
        if groups.contains(&group) {
            return Err(PermsError::already_has("track", &self.name, group));
        }
        groups.push(group);
        self.mark_dirty();
        Ok(())
    }

    /// Insert a group so that it ends up at `position`.
    pub fn insert_group(&self, group: &str, position: usize) -> Result<()> {
        let group = group.to_lowercase();
        let mut groups = self.groups.write();
        if groups.contains(&group) {
            return Err(PermsError::already_has("track", &self.name, group));
        }
        if position > groups.len() {
            return Err(PermsError::index_out_of_bounds(&self.name, position, groups.len()));
        }
        groups.insert(position, group);
        self.mark_dirty();
        Ok(())
    }

    pub fn remove_group(&self, group: &str) -> Result<()> {
        let group = group.to_lowercase();
        let mut groups = self.groups.write();
        match groups.iter().position(|g| *g == group) {
            Some(index) => {
                groups.remove(index);
                self.mark_dirty();
                Ok(())
            }
            None => Err(PermsError::lacks("track", &self.name, group)),
        }
    }

    pub fn clear_groups(&self) {
        self.groups.write().clear();
        self.mark_dirty();
    }

    /// The group after `current`, or `None` at the end.
    pub fn get_next(&self, current: &str) -> Result<Option<String>> {
        let groups = self.groups.read();
        let index = self.position_in(&groups, current)?;
        Ok(groups.get(index + 1).cloned())
    }

    /// The group before `current`, or `None` at the start.
    pub fn get_previous(&self, current: &str) -> Result<Option<String>> {
        let groups = self.groups.read();
        let index = self.position_in(&groups, current)?;
        Ok(index.checked_sub(1).and_then(|i| groups.get(i).cloned()))
    }

    fn position_in(&self, groups: &[String], current: &str) -> Result<usize> {
        let current = current.to_lowercase();
        groups
            .iter()
            .position(|g| *g == current)
            .ok_or_else(|| PermsError::lacks("track", &self.name, current))
    }

    /// Replace the sequence wholesale, e.g. after a load. Duplicates keep their first position.
    pub(crate) fn apply_loaded(&self, groups: Vec<String>) {
        let mut deduped: Vec<String> = Vec::with_capacity(groups.len());
        for group in groups {
            let group = group.to_lowercase();
            if !deduped.contains(&group) {
                deduped.push(group);
            }
        }
        *self.groups.write() = deduped;
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Lock held across a mutate-then-save sequence.
    pub fn io_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.io_lock
    }
}
