#![allow(clippy::result_large_err)]
//! # Permstack Core
//!
//! Permission inheritance resolution with pluggable multi-backend storage.
//!
//! ## Architecture
//!
//! - **Nodes**: Immutable permission and meta assertions with contexts and expiry
//! - **Model**: Users, groups and tracks held in concurrent managers
//! - **Resolution**: Weighted, context-aware inheritance with wildcard fallback
//! - **Cache**: Per-user resolved results with epoch-based invalidation
//! - **Storage**: Flat-file, SQL, Redis and in-memory backings, optionally split per entity
//! - **Service**: Load, mutate, persist and audit as one unit
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod resolution;
pub mod service;
pub mod storage;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, PermsError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheRefresher, CacheStats, RefresherHandle, UserCache};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, PermsError, Result};
    pub use crate::model::{
        validate_name, Actor, Group, GroupManager, Holder, HolderType, LogEntry, LogTarget, Track, TrackManager,
        User, UserManager,
    };
    pub use crate::node::{ContextSet, MutableContextSet, Node, NodeBuilder, Tristate};
    pub use crate::resolution::{
        MetaBundle, PlatformContext, ResolutionEngine, ResolutionOptions, ResolvedResult, StaticPlatformContext,
    };
    pub use crate::service::{HolderId, PermissionService, TrackMove};
    pub use crate::storage::{Backing, Storage, StorageFactory, StorageType};
}
