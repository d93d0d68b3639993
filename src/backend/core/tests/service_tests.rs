//! End-to-end tests of the permission service over the in-memory backing.

use async_trait::async_trait;
use permstack_core::config::Config;
use permstack_core::error::{ErrorCode, PermsError, Result};
use permstack_core::model::{Actor, Holder, LogEntry};
use permstack_core::node::{ContextSet, Node, Tristate};
use permstack_core::resolution::StaticPlatformContext;
use permstack_core::service::{HolderId, PermissionService};
use permstack_core::storage::{Backing, GroupRecord, MemoryBacking, Storage, TrackRecord, UserRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

async fn memory_service() -> PermissionService {
    service_over(Arc::new(MemoryBacking::new())).await
}

async fn service_over(backing: Arc<dyn Backing>) -> PermissionService {
    let storage = Storage::new(backing, Duration::from_secs(5));
    let service = PermissionService::new(
        Config::default(),
        storage,
        Arc::new(StaticPlatformContext::new(None, ContextSet::empty())),
    );
    service.load_all().await.unwrap();
    service
}

fn survival() -> ContextSet {
    ContextSet::singleton("server", "survival")
}

async fn wait_for_log(service: &PermissionService, count: usize) -> Vec<LogEntry> {
    for _ in 0..100 {
        let entries = service.storage().get_log().await.unwrap();
        if entries.len() >= count {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    service.storage().get_log().await.unwrap()
}

// ============================================================================
// Resolution Scenarios
// ============================================================================

#[tokio::test]
async fn test_default_and_vip_scenario() {
    let service = memory_service().await;
    let actor = Actor::console();
    service.create_group(&actor, "vip").await.unwrap();
    service.set_group_weight(&actor, "vip", 10).await.unwrap();

    service
        .grant(&actor, &HolderId::Group("default".into()), Node::builder("essentials.spawn").build())
        .await
        .unwrap();
    service
        .grant(
            &actor,
            &HolderId::Group("vip".into()),
            Node::builder("essentials.fly").server("survival").build(),
        )
        .await
        .unwrap();

    let uuid = Uuid::new_v4();
    service.load_user(uuid, Some("u")).await.unwrap();

    let result = service.result_for(uuid, &survival()).unwrap();
    assert_eq!(result.check("essentials.spawn"), Tristate::True);
    assert_eq!(result.check("group.default"), Tristate::True);
    // not a member of vip
    assert_eq!(result.check("essentials.fly"), Tristate::Undefined);
    assert_eq!(result.check("group.vip"), Tristate::Undefined);

    service
        .grant(&actor, &HolderId::User(uuid), Node::group("vip").build())
        .await
        .unwrap();
    assert_eq!(service.check_permission(uuid, "essentials.fly", &survival()), Tristate::True);
    assert_eq!(
        service.check_permission(uuid, "essentials.fly", &ContextSet::singleton("server", "creative")),
        Tristate::Undefined
    );
    assert_eq!(service.groups().get("vip").unwrap().weight(), 10);
}

#[tokio::test]
async fn test_user_negation_beats_inherited_wildcard() {
    let service = memory_service().await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, None).await.unwrap();

    service
        .grant(&actor, &HolderId::Group("default".into()), Node::builder("worldedit.*").build())
        .await
        .unwrap();
    service
        .grant(&actor, &HolderId::User(uuid), Node::builder("worldedit.delete").value(false).build())
        .await
        .unwrap();

    let contexts = ContextSet::empty();
    assert_eq!(service.check_permission(uuid, "worldedit.copy", &contexts), Tristate::True);
    assert_eq!(service.check_permission(uuid, "worldedit.delete", &contexts), Tristate::False);
}

#[tokio::test]
async fn test_group_change_reaches_cached_users() {
    let service = memory_service().await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, None).await.unwrap();

    let contexts = ContextSet::empty();
    assert_eq!(service.check_permission(uuid, "kit.daily", &contexts), Tristate::Undefined);

    service
        .grant(&actor, &HolderId::Group("default".into()), Node::builder("kit.daily").build())
        .await
        .unwrap();
    assert_eq!(service.check_permission(uuid, "kit.daily", &contexts), Tristate::True);

    service
        .revoke(&actor, &HolderId::Group("default".into()), &Node::builder("kit.daily").build())
        .await
        .unwrap();
    assert_eq!(service.check_permission(uuid, "kit.daily", &contexts), Tristate::Undefined);
}

#[tokio::test]
async fn test_meta_for_user() {
    let service = memory_service().await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, None).await.unwrap();

    service
        .grant(&actor, &HolderId::Group("default".into()), Node::prefix(10, "[Member] ").build())
        .await
        .unwrap();
    service
        .grant(&actor, &HolderId::User(uuid), Node::meta("home-limit", "3").build())
        .await
        .unwrap();

    let meta = service.meta_for(uuid, &ContextSet::empty()).unwrap();
    assert_eq!(meta.prefix(), Some("[Member] "));
    assert_eq!(meta.meta_value("home-limit"), Some("3"));
    assert!(service.meta_for(Uuid::new_v4(), &ContextSet::empty()).is_none());
}

// ============================================================================
// Tracks
// ============================================================================

async fn staff_track(service: &PermissionService) {
    let actor = Actor::console();
    for name in ["helper", "mod", "admin"] {
        service.create_group(&actor, name).await.unwrap();
    }
    service.create_track(&actor, "staff").await.unwrap();
    for name in ["helper", "mod", "admin"] {
        service.track_append(&actor, "staff", name).await.unwrap();
    }
}

#[tokio::test]
async fn test_promote_and_demote_along_track() {
    let service = memory_service().await;
    staff_track(&service).await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, Some("alex")).await.unwrap();
    let global = ContextSet::empty();

    let step = service.promote(&actor, uuid, "staff", &global).await.unwrap();
    assert_eq!((step.from, step.to.as_str()), (None, "helper"));

    let step = service.promote(&actor, uuid, "staff", &global).await.unwrap();
    assert_eq!((step.from.as_deref(), step.to.as_str()), (Some("helper"), "mod"));

    let user = service.users().get(uuid).unwrap();
    assert!(user.inherits_group("mod", &global));
    assert!(!user.inherits_group("helper", &global));
    assert!(user.inherits_group("default", &global));

    service.promote(&actor, uuid, "staff", &global).await.unwrap();
    let err = service.promote(&actor, uuid, "staff", &global).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ObjectLacks);

    for expected in ["mod", "helper"] {
        let step = service.demote(&actor, uuid, "staff", &global).await.unwrap();
        assert_eq!(step.to, expected);
    }
    let err = service.demote(&actor, uuid, "staff", &global).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ObjectLacks);

    let stored = service.storage().load_user(uuid).await.unwrap().unwrap();
    assert!(stored.nodes.iter().any(|n| n.group_name() == Some("helper")));
}

#[tokio::test]
async fn test_promotion_is_scoped_to_contexts() {
    let service = memory_service().await;
    staff_track(&service).await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, None).await.unwrap();

    service.promote(&actor, uuid, "staff", &survival()).await.unwrap();
    let step = service.promote(&actor, uuid, "staff", &ContextSet::empty()).await.unwrap();
    assert_eq!(step.from, None);

    assert_eq!(service.check_permission(uuid, "group.helper", &survival()), Tristate::True);
    let err = service.demote(&actor, uuid, "staff", &ContextSet::singleton("server", "lobby")).await;
    assert_eq!(err.unwrap_err().code(), ErrorCode::ObjectLacks);
}

#[tokio::test]
async fn test_promote_primary_group_follows() {
    let service = memory_service().await;
    staff_track(&service).await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, None).await.unwrap();
    let global = ContextSet::empty();

    service.promote(&actor, uuid, "staff", &global).await.unwrap();
    service.set_primary_group(&actor, uuid, "helper").await.unwrap();
    service.promote(&actor, uuid, "staff", &global).await.unwrap();
    assert_eq!(service.users().get(uuid).unwrap().primary_group(), "mod");
}

#[tokio::test]
async fn test_track_append_twice_fails() {
    let service = memory_service().await;
    staff_track(&service).await;
    let err = service
        .track_append(&Actor::console(), "staff", "mod")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ObjectAlreadyHas);
    assert_eq!(service.tracks().get("staff").unwrap().size(), 3);

    let err = service
        .track_append(&Actor::console(), "staff", "ghost")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let err = service
        .track_insert(&Actor::console(), "staff", "default", 9)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::IndexOutOfBounds);
}

#[tokio::test]
async fn test_delete_group_does_not_cascade() {
    let service = memory_service().await;
    let actor = Actor::console();
    for name in ["a", "b", "c"] {
        service.create_group(&actor, name).await.unwrap();
    }
    service.create_track(&actor, "t").await.unwrap();
    for name in ["a", "b", "c"] {
        service.track_append(&actor, "t", name).await.unwrap();
    }

    let dangling = service.delete_group(&actor, "b").await.unwrap();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].code(), ErrorCode::InconsistentReference);

    let track = service.tracks().get("t").unwrap();
    assert_eq!(track.groups(), vec!["a", "b", "c"]);
    assert_eq!(track.get_next("a").unwrap().as_deref(), Some("b"));
    assert!(service.storage().load_group("b").await.unwrap().is_none());

    let reported = service.verify_references();
    assert_eq!(reported.len(), 1);

    // removal of a group that is no longer loaded is allowed
    service.track_remove(&actor, "t", "b").await.unwrap();
    assert!(service.verify_references().is_empty());
}

// ============================================================================
// Persistence Semantics
// ============================================================================

#[tokio::test]
async fn test_cleanup_and_reload_user() {
    let service = memory_service().await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, Some("Notch")).await.unwrap();
    service
        .grant(&actor, &HolderId::User(uuid), Node::builder("build").build())
        .await
        .unwrap();

    service.cleanup_user(uuid).await.unwrap();
    assert!(service.users().get(uuid).is_none());

    let user = service.load_user(uuid, None).await.unwrap();
    assert_eq!(user.username().as_deref(), Some("Notch"));
    assert_eq!(service.check_permission(uuid, "build", &ContextSet::empty()), Tristate::True);
    assert_eq!(service.storage().get_name(uuid).await.unwrap().as_deref(), Some("notch"));
}

#[tokio::test]
async fn test_audit_log_records_mutations() {
    let service = memory_service().await;
    let actor = Actor::new(Uuid::new_v4(), "Admin");
    service.create_group(&actor, "builder").await.unwrap();
    service
        .grant(&actor, &HolderId::Group("builder".into()), Node::builder("worldedit.wand").build())
        .await
        .unwrap();

    let entries = wait_for_log(&service, 2).await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.actor.name == "Admin" && e.target_name == "builder"));
    assert!(entries.iter().any(|e| e.action == "set worldedit.wand"));
}

/// Memory backing whose saves can be switched to fail.
struct Flaky {
    inner: MemoryBacking,
    failing: AtomicBool,
}

impl Flaky {
    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PermsError::storage_unavailable("flaky", "disk full"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backing for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }
    async fn init(&self) -> Result<()> {
        Ok(())
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    async fn log_action(&self, entry: &LogEntry) -> Result<()> {
        self.inner.log_action(entry).await
    }
    async fn get_log(&self) -> Result<Vec<LogEntry>> {
        self.inner.get_log().await
    }
    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        self.inner.load_user(uuid).await
    }
    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.check()?;
        self.inner.save_user(user).await
    }
    async fn get_unique_users(&self) -> Result<Vec<Uuid>> {
        self.inner.get_unique_users().await
    }
    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<()> {
        self.check()?;
        self.inner.save_uuid_data(username, uuid).await
    }
    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>> {
        self.inner.get_uuid(username).await
    }
    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>> {
        self.inner.get_name(uuid).await
    }
    async fn create_and_load_group(&self, name: &str) -> Result<GroupRecord> {
        self.inner.create_and_load_group(name).await
    }
    async fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        self.inner.load_group(name).await
    }
    async fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        self.inner.load_all_groups().await
    }
    async fn save_group(&self, group: &GroupRecord) -> Result<()> {
        self.check()?;
        self.inner.save_group(group).await
    }
    async fn delete_group(&self, name: &str) -> Result<()> {
        self.inner.delete_group(name).await
    }
    async fn create_and_load_track(&self, name: &str) -> Result<TrackRecord> {
        self.inner.create_and_load_track(name).await
    }
    async fn load_track(&self, name: &str) -> Result<Option<TrackRecord>> {
        self.inner.load_track(name).await
    }
    async fn load_all_tracks(&self) -> Result<Vec<TrackRecord>> {
        self.inner.load_all_tracks().await
    }
    async fn save_track(&self, track: &TrackRecord) -> Result<()> {
        self.check()?;
        self.inner.save_track(track).await
    }
    async fn delete_track(&self, name: &str) -> Result<()> {
        self.inner.delete_track(name).await
    }
}

#[tokio::test]
async fn test_failed_save_keeps_last_known_good() {
    let flaky = Arc::new(Flaky {
        inner: MemoryBacking::new(),
        failing: AtomicBool::new(false),
    });
    let service = service_over(flaky.clone()).await;
    let actor = Actor::console();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, None).await.unwrap();
    service
        .grant(&actor, &HolderId::User(uuid), Node::builder("chat.color").build())
        .await
        .unwrap();

    flaky.failing.store(true, Ordering::SeqCst);
    let err = service
        .grant(&actor, &HolderId::User(uuid), Node::builder("chat.bold").build())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StorageUnavailable);

    let err = service
        .grant(&actor, &HolderId::Group("default".into()), Node::builder("chat.bold").build())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StorageUnavailable);

    let contexts = ContextSet::empty();
    assert_eq!(service.check_permission(uuid, "chat.color", &contexts), Tristate::True);
    assert_eq!(service.check_permission(uuid, "chat.bold", &contexts), Tristate::Undefined);
    assert!(service.groups().get("default").unwrap().nodes().is_empty());

    flaky.failing.store(false, Ordering::SeqCst);
    service
        .grant(&actor, &HolderId::User(uuid), Node::builder("chat.bold").build())
        .await
        .unwrap();
    assert_eq!(service.check_permission(uuid, "chat.bold", &contexts), Tristate::True);
}

#[tokio::test]
async fn test_uuid_cache_failure_still_loads_user() {
    let flaky = Arc::new(Flaky {
        inner: MemoryBacking::new(),
        failing: AtomicBool::new(true),
    });
    let service = service_over(flaky.clone()).await;
    let uuid = Uuid::new_v4();

    let user = service.load_user(uuid, Some("Notch")).await.unwrap();
    assert_eq!(user.username().as_deref(), Some("Notch"));
    assert!(service.users().get(uuid).is_some());
    assert_eq!(service.storage().get_uuid("notch").await.unwrap(), None);
    assert_eq!(service.check_permission(uuid, "group.default", &ContextSet::empty()), Tristate::True);

    flaky.failing.store(false, Ordering::SeqCst);
    service.load_user(uuid, Some("Notch")).await.unwrap();
    assert_eq!(service.storage().get_uuid("notch").await.unwrap(), Some(uuid));
}

#[tokio::test]
async fn test_refresher_keeps_entries_current() {
    let mut config = Config::default();
    config.cache.refresh_interval = Some(Duration::from_millis(20));
    let service = PermissionService::new(
        config,
        Storage::new(Arc::new(MemoryBacking::new()), Duration::from_secs(5)),
        Arc::new(StaticPlatformContext::new(None, ContextSet::empty())),
    );
    service.load_all().await.unwrap();
    let uuid = Uuid::new_v4();
    service.load_user(uuid, None).await.unwrap();
    service.check_permission(uuid, "a", &ContextSet::empty());

    let handle = service.start_cache_refresher().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.passes() > 0);
    handle.shutdown().await;
}
