//! Per-user cache of resolved results.
//!
//! Entries are keyed by the exact query context set and stamped with the
//! user's version and the group manager's epoch at the time they were
//! computed. User mutations clear the cache eagerly; group mutations only
//! advance the epoch, and affected entries are recomputed on next access.
//!
//! # Example
//!
//! ```rust,ignore
//! let result = user.cache().get_or_compute(&user, &contexts, &engine);
//! if result.has_permission("essentials.fly") {
//!     // ...
//! }
//! ```

mod refresher;

pub use refresher::{CacheRefresher, RefresherHandle};

use crate::model::User;
use crate::node::ContextSet;
use crate::resolution::{ResolutionEngine, ResolvedResult};
use crate::telemetry::metrics::{CACHE_HITS, CACHE_INVALIDATIONS, CACHE_MISSES};
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,

    /// Lookups that had to resolve
    pub misses: u64,

    /// Cached context sets
    pub entries: u64,

    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl CacheStats {
    /// Calculate the hit rate.
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }

    /// Sum of several caches.
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.entries += other.entries;
        self.calculate_hit_rate();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// User Cache
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    user_version: u64,
    group_epoch: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Arc<ResolvedResult>,
    stamp: Stamp,
}

/// Resolved results of one user, keyed by query context set.
#[derive(Debug, Default)]
pub struct UserCache {
    entries: DashMap<ContextSet, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached result for `contexts`, computing it if absent or stale.
    #[instrument(skip(self, user, engine), fields(user = %user.uuid(), contexts = %contexts))]
    pub fn get_or_compute(
        &self,
        user: &User,
        contexts: &ContextSet,
        engine: &ResolutionEngine,
    ) -> Arc<ResolvedResult> {
        let stamp = Self::stamp(user, engine);
        let now = Utc::now();

        if let Some(entry) = self.entries.get(contexts) {
            if entry.stamp == stamp && !entry.result.is_stale_at(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(CACHE_HITS).increment(1);
                return entry.result.clone();
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(CACHE_MISSES).increment(1);

        // stamp taken before resolving: a concurrent change leaves this entry stale
        let result = Arc::new(engine.resolve_at(user, contexts, now));
        self.entries.insert(
            contexts.clone(),
            CacheEntry {
                result: result.clone(),
                stamp,
            },
        );
        result
    }

    /// The cached result if present and current, without computing.
    pub fn get_if_present(&self, user: &User, contexts: &ContextSet, engine: &ResolutionEngine) -> Option<Arc<ResolvedResult>> {
        let stamp = Self::stamp(user, engine);
        self.entries
            .get(contexts)
            .filter(|entry| entry.stamp == stamp && !entry.result.is_stale_at(Utc::now()))
            .map(|entry| entry.result.clone())
    }

    /// Drop every cached entry.
    pub fn invalidate(&self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            counter!(CACHE_INVALIDATIONS).increment(1);
        }
    }

    /// Drop the entry of one context set.
    pub fn invalidate_context(&self, contexts: &ContextSet) {
        self.entries.remove(contexts);
    }

    /// Recompute every cached context that is stale. Returns how many were recomputed.
    pub fn refresh(&self, user: &User, engine: &ResolutionEngine) -> usize {
        let stamp = Self::stamp(user, engine);
        let now = Utc::now();
        let stale: Vec<ContextSet> = self
            .entries
            .iter()
            .filter(|e| e.stamp != stamp || e.result.is_stale_at(now))
            .map(|e| e.key().clone())
            .collect();

        for contexts in &stale {
            let result = Arc::new(engine.resolve_at(user, contexts, now));
            self.entries.insert(contexts.clone(), CacheEntry { result, stamp });
        }
        if !stale.is_empty() {
            debug!(user = %user.uuid(), refreshed = stale.len(), "Refreshed cached contexts");
        }
        stale.len()
    }

    /// Context sets currently cached.
    pub fn cached_contexts(&self) -> Vec<ContextSet> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        stats
    }

    fn stamp(user: &User, engine: &ResolutionEngine) -> Stamp {
        Stamp {
            user_version: user.version(),
            group_epoch: engine.groups().epoch(),
        }
    }
}
