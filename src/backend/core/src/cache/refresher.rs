//! Background recomputation of cached contexts.

use crate::model::UserManager;
use crate::resolution::ResolutionEngine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Periodically recomputes stale cache entries of every loaded user so that
/// permission checks for known-active contexts stay hits.
pub struct CacheRefresher {
    users: Arc<UserManager>,
    engine: ResolutionEngine,
    interval: Duration,
}

impl CacheRefresher {
    pub fn new(users: Arc<UserManager>, engine: ResolutionEngine, interval: Duration) -> Self {
        Self {
            users,
            engine,
            interval,
        }
    }

    /// Run one pass over every loaded user. Returns how many entries were recomputed.
    pub fn refresh_all(&self) -> usize {
        self.users
            .all()
            .iter()
            .map(|user| user.cache().refresh(user, &self.engine))
            .sum()
    }

    /// Spawn the refresh loop on the current runtime.
    pub fn start(self) -> RefresherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let passes = Arc::new(AtomicU64::new(0));
        let pass_counter = passes.clone();

        let task = tokio::spawn(async move {
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "Cache refresher started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.interval) => {
                        let refreshed = self.refresh_all();
                        pass_counter.fetch_add(1, Ordering::Relaxed);
                        if refreshed > 0 {
                            tracing::debug!(refreshed, "Cache refresh pass complete");
                        }
                    }
                }
            }

            tracing::info!("Cache refresher stopped");
        });

        RefresherHandle {
            shutdown: shutdown_tx,
            passes,
            task,
        }
    }
}

/// Handle onto a running refresher.
pub struct RefresherHandle {
    shutdown: watch::Sender<bool>,
    passes: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Completed refresh passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Cache refresher task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupManager, Holder};
    use crate::node::{ContextSet, Node};
    use crate::resolution::ResolutionOptions;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_refresher_recomputes_and_stops() {
        let groups = Arc::new(GroupManager::new());
        let engine = ResolutionEngine::new(groups.clone(), ResolutionOptions::default());
        let users = Arc::new(UserManager::new("default"));
        let default = groups.get_or_make("default");

        let user = users.get_or_make(Uuid::new_v4(), Some("u"));
        user.cache().get_or_compute(&user, &ContextSet::empty(), &engine);
        default.set_permission(Node::builder("fresh").build()).unwrap();

        let handle = CacheRefresher::new(users.clone(), engine.clone(), Duration::from_millis(10)).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.passes() > 0);

        let cached = user
            .cache()
            .get_if_present(&user, &ContextSet::empty(), &engine)
            .unwrap();
        assert!(cached.has_permission("fresh"));

        handle.shutdown().await;
    }

    #[test]
    fn test_refresh_all_without_users() {
        let groups = Arc::new(GroupManager::new());
        let engine = ResolutionEngine::new(groups, ResolutionOptions::default());
        let refresher = CacheRefresher::new(Arc::new(UserManager::new("default")), engine, Duration::from_secs(1));
        assert_eq!(refresher.refresh_all(), 0);
    }
}
