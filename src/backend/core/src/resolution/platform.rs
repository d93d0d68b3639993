//! The capabilities the engine needs from the hosting platform.

use crate::config::Config;
use crate::node::{ContextSet, MutableContextSet, SERVER_KEY, WORLD_KEY};
use dashmap::DashMap;
use uuid::Uuid;

/// Platform facts injected at construction.
pub trait PlatformContext: Send + Sync {
    /// Identifier of this server, `None` when global.
    fn server_identifier(&self) -> Option<String>;

    /// World the user is currently in, if the platform knows it.
    fn world_of(&self, user: Uuid) -> Option<String>;

    /// Contexts added to every query.
    fn static_contexts(&self) -> ContextSet {
        ContextSet::empty()
    }

    /// The query context set for a user right now.
    fn contexts_for(&self, user: Uuid) -> ContextSet {
        let mut contexts = MutableContextSet::new();
        contexts.add_all(&self.static_contexts());
        if let Some(server) = self.server_identifier() {
            contexts.add(SERVER_KEY, server);
        }
        if let Some(world) = self.world_of(user) {
            contexts.add(WORLD_KEY, world);
        }
        contexts.build()
    }
}

/// A platform context backed by configuration plus worlds reported by the host.
#[derive(Debug, Default)]
pub struct StaticPlatformContext {
    server: Option<String>,
    static_contexts: ContextSet,
    worlds: DashMap<Uuid, String>,
}

impl StaticPlatformContext {
    pub fn new(server: Option<&str>, static_contexts: ContextSet) -> Self {
        Self {
            server: server.map(str::to_string),
            static_contexts,
            worlds: DashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.server_context(),
            ContextSet::of(config.resolution.static_contexts.iter()),
        )
    }

    /// Record the world a user moved to.
    pub fn set_world(&self, user: Uuid, world: &str) {
        self.worlds.insert(user, world.to_string());
    }

    pub fn clear_world(&self, user: Uuid) {
        self.worlds.remove(&user);
    }
}

impl PlatformContext for StaticPlatformContext {
    fn server_identifier(&self) -> Option<String> {
        self.server.clone()
    }

    fn world_of(&self, user: Uuid) -> Option<String> {
        self.worlds.get(&user).map(|w| w.value().clone())
    }

    fn static_contexts(&self) -> ContextSet {
        self.static_contexts.clone()
    }
}
