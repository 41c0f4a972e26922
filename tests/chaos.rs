//! Chaos Testing for Perms Storage
//!
//! Failure scenarios driven by a [`FailingDriver`] wrapper that injects
//! errors (or panics) into chosen driver operations:
//! 1. **Flush failures** - buffered writes are dropped, not retried
//! 2. **Split init/shutdown failures** - aggregate errors, best-effort teardown
//! 3. **Bulk update partial failure** - every backend attempted, overall failure
//! 4. **Worker panics** - surfaced as `StorageError::Worker`
//! 5. **Slow backends** - a stalled bulk update still excludes single writes
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use perms_storage::{
    ActionLog, BroadcastDispatcher, BulkAction, BulkTarget, BulkUpdate, Comparison, Constraint, DataKind, Driver,
    Group, HeldPermission, LoadedEntities, LogEntry, MemoryDriver, Meta, Node, NodeField, SplitDriver, Storage,
    StorageBuilder, StorageConfig, StorageError, Track, User,
};

// =============================================================================
// Failing Driver Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a [`MemoryDriver`] and fails the operations named in `failing`.
pub struct FailingDriver {
    inner: MemoryDriver,
    failing: Mutex<HashSet<&'static str>>,
    panicking: Mutex<HashSet<&'static str>>,
    stalls: Mutex<HashMap<&'static str, Duration>>,
    completed: Mutex<Vec<&'static str>>,
    calls: AtomicU64,
}

impl FailingDriver {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryDriver::named(name),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
            stalls: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    pub fn panic_on(&self, op: &'static str) {
        self.panicking.lock().insert(op);
    }

    /// Make `op` block its worker thread for `delay` before running.
    pub fn stall(&self, op: &'static str, delay: Duration) {
        self.stalls.lock().insert(op, delay);
    }

    /// Operations in the order they got past injection.
    pub fn completed(&self) -> Vec<&'static str> {
        self.completed.lock().clone()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn memory(&self) -> &MemoryDriver {
        &self.inner
    }

    fn check(&self, op: &'static str) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panicking.lock().contains(op) {
            panic!("injected panic in {}", op);
        }
        if self.failing.lock().contains(op) {
            return Err(StorageError::backend(self.inner.name(), format!("injected {} failure", op)));
        }
        let stall = self.stalls.lock().get(op).copied();
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        self.completed.lock().push(op);
        Ok(())
    }
}

impl Driver for FailingDriver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init(&self) -> Result<(), StorageError> {
        self.check("init")?;
        self.inner.init()
    }

    fn shutdown(&self) -> Result<(), StorageError> {
        self.check("shutdown")?;
        self.inner.shutdown()
    }

    fn meta(&self) -> Meta {
        self.inner.meta()
    }

    fn log_action(&self, entry: &LogEntry) -> Result<(), StorageError> {
        self.check("log_action")?;
        self.inner.log_action(entry)
    }

    fn get_log(&self) -> Result<ActionLog, StorageError> {
        self.check("get_log")?;
        self.inner.get_log()
    }

    fn apply_bulk_update(&self, update: &BulkUpdate) -> Result<(), StorageError> {
        self.check("apply_bulk_update")?;
        self.inner.apply_bulk_update(update)
    }

    fn load_user(&self, uuid: Uuid, username: Option<&str>) -> Result<User, StorageError> {
        self.check("load_user")?;
        self.inner.load_user(uuid, username)
    }

    fn save_user(&self, user: &User) -> Result<(), StorageError> {
        self.check("save_user")?;
        self.inner.save_user(user)
    }

    fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError> {
        self.check("get_unique_users")?;
        self.inner.get_unique_users()
    }

    fn get_users_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<Uuid>>, StorageError> {
        self.check("get_users_with_permission")?;
        self.inner.get_users_with_permission(permission)
    }

    fn create_and_load_group(&self, name: &str) -> Result<Group, StorageError> {
        self.check("create_and_load_group")?;
        self.inner.create_and_load_group(name)
    }

    fn load_group(&self, name: &str) -> Result<Option<Group>, StorageError> {
        self.check("load_group")?;
        self.inner.load_group(name)
    }

    fn load_all_groups(&self) -> Result<Vec<Group>, StorageError> {
        self.check("load_all_groups")?;
        self.inner.load_all_groups()
    }

    fn save_group(&self, group: &Group) -> Result<(), StorageError> {
        self.check("save_group")?;
        self.inner.save_group(group)
    }

    fn delete_group(&self, group: &Group) -> Result<(), StorageError> {
        self.check("delete_group")?;
        self.inner.delete_group(group)
    }

    fn get_groups_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<String>>, StorageError> {
        self.check("get_groups_with_permission")?;
        self.inner.get_groups_with_permission(permission)
    }

    fn create_and_load_track(&self, name: &str) -> Result<Track, StorageError> {
        self.check("create_and_load_track")?;
        self.inner.create_and_load_track(name)
    }

    fn load_track(&self, name: &str) -> Result<Option<Track>, StorageError> {
        self.check("load_track")?;
        self.inner.load_track(name)
    }

    fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError> {
        self.check("load_all_tracks")?;
        self.inner.load_all_tracks()
    }

    fn save_track(&self, track: &Track) -> Result<(), StorageError> {
        self.check("save_track")?;
        self.inner.save_track(track)
    }

    fn delete_track(&self, track: &Track) -> Result<(), StorageError> {
        self.check("delete_track")?;
        self.inner.delete_track(track)
    }

    fn save_uuid_data(&self, uuid: Uuid, username: &str) -> Result<(), StorageError> {
        self.check("save_uuid_data")?;
        self.inner.save_uuid_data(uuid, username)
    }

    fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError> {
        self.check("get_uuid")?;
        self.inner.get_uuid(username)
    }

    fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError> {
        self.check("get_name")?;
        self.inner.get_name(uuid)
    }
}

fn user_with(uuid: Uuid, perm: &str) -> User {
    let mut user = User::new(uuid, None);
    user.nodes.push(Node::new(perm));
    user
}

fn split_types(user: &str, group: &str) -> HashMap<DataKind, String> {
    DataKind::ALL
        .iter()
        .map(|kind| {
            let backend = if *kind == DataKind::Group { group } else { user };
            (*kind, backend.to_string())
        })
        .collect()
}

// =============================================================================
// Buffer flush failures
// =============================================================================

#[tokio::test]
async fn chaos_failed_flush_drops_write_without_retry() {
    let driver = Arc::new(FailingDriver::new("Flaky"));
    let storage = StorageBuilder::new(StorageConfig { buffer_flush_ms: 60_000, ..Default::default() })
        .backend("flaky", driver.clone())
        .build()
        .unwrap();
    let uuid = Uuid::new_v4();

    driver.fail("save_user");
    // The caller is told nothing: buffered writes are acknowledged on enqueue
    storage.save_user(user_with(uuid, "lost")).await.unwrap();
    storage.force_flush().await;
    assert!(driver.memory().stored_user(uuid).is_none());

    // Healing the backend does not resurrect the dropped write
    driver.heal("save_user");
    storage.force_flush().await;
    assert!(driver.memory().stored_user(uuid).is_none());

    storage.save_user(user_with(uuid, "kept")).await.unwrap();
    storage.force_flush().await;
    assert!(driver.memory().stored_user(uuid).is_some());
}

#[tokio::test]
async fn chaos_unbuffered_write_reports_failure() {
    let driver = Arc::new(FailingDriver::new("Flaky"));
    let storage = StorageBuilder::new(StorageConfig::default())
        .backend("flaky", driver.clone())
        .build()
        .unwrap();
    driver.fail("save_group");

    let result = storage.clone().no_buffer().save_group(Group::new("staff")).await;
    assert!(matches!(result, Err(StorageError::Backend { .. })));
}

// =============================================================================
// Facade error propagation
// =============================================================================

#[tokio::test]
async fn chaos_failed_load_propagates_and_emits_nothing() {
    let driver = Arc::new(FailingDriver::new("Flaky"));
    let entities = Arc::new(LoadedEntities::new());
    let events = Arc::new(BroadcastDispatcher::new(8));
    let mut rx = events.subscribe();
    let storage = StorageBuilder::new(StorageConfig::default())
        .backend("flaky", driver.clone())
        .entities(entities.clone())
        .events(events)
        .build()
        .unwrap();

    let uuid = Uuid::new_v4();
    entities.insert_user(User::new(uuid, None));
    driver.fail("load_user");

    let result = storage.load_user(uuid, None).await;
    assert_eq!(
        result,
        Err(StorageError::backend("Flaky", "injected load_user failure"))
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn chaos_driver_panic_becomes_worker_error() {
    let driver = Arc::new(FailingDriver::new("Flaky"));
    let storage = StorageBuilder::new(StorageConfig::default())
        .backend("flaky", driver.clone())
        .build()
        .unwrap();
    driver.panic_on("get_unique_users");

    let result = storage.get_unique_users().await;
    assert!(matches!(result, Err(StorageError::Worker(_))));

    // The pool survives the panic
    assert!(storage.get_uuid("nobody".into()).await.unwrap().is_none());
}

// =============================================================================
// Split init / shutdown failures
// =============================================================================

#[tokio::test]
async fn chaos_split_init_failure_names_backend_without_rollback() {
    let sql = Arc::new(FailingDriver::new("H2"));
    let mongo = Arc::new(FailingDriver::new("MongoDB"));
    mongo.fail("init");

    let router = SplitDriver::new(
        HashMap::from([
            ("sql".to_string(), sql.clone() as Arc<dyn Driver>),
            ("mongo".to_string(), mongo.clone() as Arc<dyn Driver>),
        ]),
        split_types("sql", "mongo"),
    )
    .unwrap();
    let storage = StorageBuilder::new(StorageConfig::default())
        .backend("split", Arc::new(router))
        .build()
        .unwrap();

    let result = storage.init().await;
    assert_eq!(result, Err(StorageError::Init { failed: vec!["mongo".to_string()] }));
    assert!(sql.memory().is_running());
    assert!(!mongo.memory().is_running());

    // Normal shutdown still cleans up the backend that did start
    storage.shutdown().await;
    assert!(!sql.memory().is_running());
}

#[tokio::test]
async fn chaos_split_shutdown_is_best_effort_and_once() {
    let sql = Arc::new(FailingDriver::new("H2"));
    let mongo = Arc::new(FailingDriver::new("MongoDB"));
    let router = SplitDriver::new(
        HashMap::from([
            ("sql".to_string(), sql.clone() as Arc<dyn Driver>),
            ("mongo".to_string(), mongo.clone() as Arc<dyn Driver>),
        ]),
        split_types("sql", "mongo"),
    )
    .unwrap();
    router.init().unwrap();

    // "sql" shuts down first (reverse name order) and fails
    sql.fail("shutdown");
    router.shutdown().unwrap();
    assert!(!mongo.memory().is_running());

    let calls = (sql.calls(), mongo.calls());
    router.shutdown().unwrap();
    assert_eq!((sql.calls(), mongo.calls()), calls);
}

// =============================================================================
// Bulk update partial failure
// =============================================================================

#[tokio::test]
async fn chaos_bulk_update_attempts_every_backend() {
    let sql = Arc::new(FailingDriver::new("H2"));
    let mongo = Arc::new(FailingDriver::new("MongoDB"));
    let router = Arc::new(
        SplitDriver::new(
            HashMap::from([
                ("sql".to_string(), sql.clone() as Arc<dyn Driver>),
                ("mongo".to_string(), mongo.clone() as Arc<dyn Driver>),
            ]),
            split_types("sql", "mongo"),
        )
        .unwrap(),
    );
    let uuid = Uuid::new_v4();
    sql.save_user(&user_with(uuid, "doomed")).unwrap();

    let storage = StorageBuilder::new(StorageConfig::default())
        .backend("split", router)
        .build()
        .unwrap();

    // The group backend fails; the user backend still applies the update
    mongo.fail("apply_bulk_update");
    let update = BulkUpdate::new(BulkTarget::All, BulkAction::Delete);
    let result = storage.apply_bulk_update(update).await;

    assert!(matches!(result, Err(StorageError::Backend { ref backend, .. }) if backend == "MongoDB"));
    assert!(sql.memory().stored_user(uuid).unwrap().nodes.is_empty());
}

// =============================================================================
// Slow backends
// =============================================================================

#[tokio::test]
async fn chaos_slow_bulk_update_holds_back_concurrent_save() {
    let driver = Arc::new(FailingDriver::new("Slow"));
    let storage = StorageBuilder::new(StorageConfig::default())
        .backend("slow", driver.clone())
        .build()
        .unwrap();
    storage.init().await.unwrap();

    let uuid = Uuid::new_v4();
    driver.memory().save_user(&user_with(uuid, "legacy.node")).unwrap();
    driver.stall("apply_bulk_update", Duration::from_millis(200));

    let update = BulkUpdate::new(BulkTarget::Users, BulkAction::Delete)
        .with_constraint(Constraint::new(NodeField::Permission, Comparison::Equal, "legacy.node"));
    let bulk = tokio::spawn({
        let storage = storage.clone();
        async move { storage.apply_bulk_update(update).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while !storage.in_phase(DataKind::User) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("bulk update never started its phase");

    // Re-adds the node the bulk update is deleting
    let save = tokio::spawn({
        let storage = storage.clone();
        async move { storage.no_buffer().save_user(user_with(uuid, "legacy.node")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!save.is_finished(), "save ran while the bulk update was in progress");

    bulk.await.unwrap().unwrap();
    save.await.unwrap().unwrap();

    let order: Vec<&str> = driver
        .completed()
        .into_iter()
        .filter(|op| matches!(*op, "apply_bulk_update" | "save_user"))
        .collect();
    assert_eq!(order, vec!["apply_bulk_update", "save_user"]);

    let stored = driver.memory().stored_user(uuid).unwrap();
    assert!(stored.nodes.iter().any(|n| n.permission == "legacy.node"));
}
