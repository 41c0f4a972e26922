// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write buffer: coalesces keyed saves and flushes them in the background.
//!
//! `save_user`, `save_group`, `save_track` and `save_uuid_data` are
//! acknowledged as soon as they are queued. A background task wakes every
//! `flush_tick` and issues each write that has waited at least one flush
//! window. A write that fails at flush time is logged and dropped; callers
//! that need to see the outcome go through [`Storage::no_buffer`].
//!
//! Deleting a group or track discards its pending save, so a delete is never
//! undone by an older buffered write. The same holds for the write-through
//! handle returned by `no_buffer()`: a direct save or delete drops the
//! pending save for its key first.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batching::coalescer::{Coalescer, FlushBatch, FlushReason};
use crate::bulk::BulkUpdate;
use crate::config::StorageConfig;
use crate::events::{CreationCause, DeletionCause};
use crate::model::{normalize_name, ActionLog, DataKind, Group, HeldPermission, LogEntry, Track, User};
use crate::storage::traits::{Meta, StorageError};

use super::Storage;

/// Logical key a buffered write is coalesced under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BufferKey {
    User(Uuid),
    Group(String),
    Track(String),
    UuidData(Uuid),
}

impl BufferKey {
    #[must_use]
    pub fn kind(&self) -> DataKind {
        match self {
            Self::User(_) => DataKind::User,
            Self::Group(_) => DataKind::Group,
            Self::Track(_) => DataKind::Track,
            Self::UuidData(_) => DataKind::Uuid,
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(uuid) => write!(f, "user:{}", uuid),
            Self::Group(name) => write!(f, "group:{}", name),
            Self::Track(name) => write!(f, "track:{}", name),
            Self::UuidData(uuid) => write!(f, "uuid:{}", uuid),
        }
    }
}

/// A queued write.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    User(User),
    Group(Group),
    Track(Track),
    UuidData { uuid: Uuid, username: String },
}

impl PendingWrite {
    fn key(&self) -> BufferKey {
        match self {
            Self::User(user) => BufferKey::User(user.uuid),
            Self::Group(group) => BufferKey::Group(normalize_name(&group.name)),
            Self::Track(track) => BufferKey::Track(normalize_name(&track.name)),
            Self::UuidData { uuid, .. } => BufferKey::UuidData(*uuid),
        }
    }

    async fn issue(self, inner: &dyn Storage) -> Result<(), StorageError> {
        match self {
            Self::User(user) => inner.save_user(user).await,
            Self::Group(group) => inner.save_group(group).await,
            Self::Track(track) => inner.save_track(track).await,
            Self::UuidData { uuid, username } => inner.save_uuid_data(uuid, username).await,
        }
    }
}

/// State shared between the buffer and its flush task.
struct Flusher {
    inner: Arc<dyn Storage>,
    pending: Coalescer<BufferKey, PendingWrite>,
    /// Serialises flushes so two writes for one key are never in flight together
    flush_lock: tokio::sync::Mutex<()>,
}

impl Flusher {
    async fn flush(&self, reason: FlushReason) {
        let _guard = self.flush_lock.lock().await;
        let batch = match reason {
            FlushReason::Time => self.pending.take_ready(),
            other => self.pending.force_flush_with_reason(other),
        };
        if let Some(batch) = batch {
            self.issue(batch).await;
        }
    }

    /// Run `op` under the flush lock after dropping any pending save for
    /// `key`, so no flush can land an older value afterwards.
    async fn discard_then<T, F>(&self, key: BufferKey, op: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = Result<T, StorageError>>,
    {
        let _guard = self.flush_lock.lock().await;
        if self.pending.discard(&key) {
            debug!(key = %key, "Discarded pending save superseded by a direct write");
            crate::metrics::set_buffer_pending(self.pending.len());
        }
        op.await
    }

    #[tracing::instrument(skip(self, batch), fields(reason = %batch.reason, count = batch.items.len()))]
    async fn issue(&self, batch: FlushBatch<BufferKey, PendingWrite>) {
        crate::metrics::record_flush(batch.reason.as_str(), batch.items.len());
        let writes = batch.items.into_iter().map(|(key, write)| async move {
            if let Err(e) = write.issue(self.inner.as_ref()).await {
                warn!(key = %key, error = %e, "Dropping buffered write after failed flush");
                crate::metrics::record_flush_failure(key.kind());
            }
        });
        join_all(writes).await;
        crate::metrics::set_buffer_pending(self.pending.len());
        debug!("Flush complete");
    }

    async fn run(self: Arc<Self>, tick: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush(FlushReason::Time).await,
                _ = shutdown.cancelled() => {
                    debug!("Buffer flush task stopping");
                    break;
                }
            }
        }
    }
}

pub struct BufferedStorage {
    flusher: Arc<Flusher>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl BufferedStorage {
    /// Wrap `inner` and start the flush task. Must run inside a tokio runtime.
    pub fn new(inner: Arc<dyn Storage>, config: &StorageConfig) -> Arc<Self> {
        let flusher = Arc::new(Flusher {
            inner,
            pending: Coalescer::new(config.flush_window()),
            flush_lock: tokio::sync::Mutex::new(()),
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(flusher.clone().run(config.flush_tick(), shutdown.clone()));
        debug!(
            window_ms = config.buffer_flush_ms,
            tick_ms = config.flush_tick_ms,
            "Write buffer started"
        );

        Arc::new(Self {
            flusher,
            shutdown,
            task: Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Number of writes waiting to be flushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.flusher.pending.len()
    }

    fn enqueue(&self, write: PendingWrite) -> Result<(), StorageError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(StorageError::ShutDown);
        }
        let key = write.key();
        let kind = key.kind();
        if self.flusher.pending.push(key, write) {
            crate::metrics::record_coalesced(kind);
        }
        crate::metrics::record_operation("buffer", "enqueue", "queued");
        crate::metrics::set_buffer_pending(self.flusher.pending.len());
        Ok(())
    }

    fn inner(&self) -> &dyn Storage {
        self.flusher.inner.as_ref()
    }
}

impl Drop for BufferedStorage {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Storage for BufferedStorage {
    fn name(&self) -> String {
        self.inner().name()
    }

    fn meta(&self) -> Meta {
        self.inner().meta()
    }

    async fn init(&self) -> Result<(), StorageError> {
        self.inner().init().await
    }

    #[tracing::instrument(skip(self))]
    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Write buffer already shut down");
            return;
        }
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Buffer flush task ended abnormally");
            }
        }

        let remaining = self.pending();
        if remaining > 0 {
            info!(remaining, "Flushing buffered writes before shutdown");
        }
        self.flusher.flush(FlushReason::Shutdown).await;
        self.inner().shutdown().await;
    }

    fn no_buffer(self: Arc<Self>) -> Arc<dyn Storage> {
        Arc::new(WriteThrough {
            direct: self.flusher.inner.clone().no_buffer(),
            flusher: self.flusher.clone(),
        })
    }

    async fn force_flush(&self) {
        self.flusher.flush(FlushReason::Manual).await;
        self.inner().force_flush().await;
    }

    async fn log_action(&self, entry: LogEntry) -> Result<(), StorageError> {
        self.inner().log_action(entry).await
    }

    async fn get_log(&self) -> Result<ActionLog, StorageError> {
        self.inner().get_log().await
    }

    async fn apply_bulk_update(&self, update: BulkUpdate) -> Result<(), StorageError> {
        self.inner().apply_bulk_update(update).await
    }

    async fn load_user(&self, uuid: Uuid, username: Option<String>) -> Result<User, StorageError> {
        self.inner().load_user(uuid, username).await
    }

    async fn save_user(&self, user: User) -> Result<(), StorageError> {
        self.enqueue(PendingWrite::User(user))
    }

    async fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError> {
        self.inner().get_unique_users().await
    }

    async fn get_users_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<Uuid>>, StorageError> {
        self.inner().get_users_with_permission(permission).await
    }

    async fn create_and_load_group(&self, name: String, cause: CreationCause) -> Result<Group, StorageError> {
        self.inner().create_and_load_group(name, cause).await
    }

    async fn load_group(&self, name: String) -> Result<Option<Group>, StorageError> {
        self.inner().load_group(name).await
    }

    async fn load_all_groups(&self) -> Result<Vec<Group>, StorageError> {
        self.inner().load_all_groups().await
    }

    async fn save_group(&self, group: Group) -> Result<(), StorageError> {
        self.enqueue(PendingWrite::Group(group))
    }

    async fn delete_group(&self, group: Group, cause: DeletionCause) -> Result<(), StorageError> {
        let key = BufferKey::Group(normalize_name(&group.name));
        self.flusher.discard_then(key, self.inner().delete_group(group, cause)).await
    }

    async fn get_groups_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<String>>, StorageError> {
        self.inner().get_groups_with_permission(permission).await
    }

    async fn create_and_load_track(&self, name: String, cause: CreationCause) -> Result<Track, StorageError> {
        self.inner().create_and_load_track(name, cause).await
    }

    async fn load_track(&self, name: String) -> Result<Option<Track>, StorageError> {
        self.inner().load_track(name).await
    }

    async fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError> {
        self.inner().load_all_tracks().await
    }

    async fn save_track(&self, track: Track) -> Result<(), StorageError> {
        self.enqueue(PendingWrite::Track(track))
    }

    async fn delete_track(&self, track: Track, cause: DeletionCause) -> Result<(), StorageError> {
        let key = BufferKey::Track(normalize_name(&track.name));
        self.flusher.discard_then(key, self.inner().delete_track(track, cause)).await
    }

    async fn save_uuid_data(&self, uuid: Uuid, username: String) -> Result<(), StorageError> {
        self.enqueue(PendingWrite::UuidData { uuid, username })
    }

    async fn get_uuid(&self, username: String) -> Result<Option<Uuid>, StorageError> {
        self.inner().get_uuid(username).await
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError> {
        self.inner().get_name(uuid).await
    }
}

/// Unbuffered view of a [`BufferedStorage`].
///
/// Writes go straight to the inner stack, but first supersede whatever the
/// buffer still holds for the same key.
struct WriteThrough {
    direct: Arc<dyn Storage>,
    flusher: Arc<Flusher>,
}

#[async_trait]
impl Storage for WriteThrough {
    fn name(&self) -> String {
        self.direct.name()
    }

    fn meta(&self) -> Meta {
        self.direct.meta()
    }

    async fn init(&self) -> Result<(), StorageError> {
        self.direct.init().await
    }

    async fn shutdown(&self) {
        self.direct.shutdown().await
    }

    fn no_buffer(self: Arc<Self>) -> Arc<dyn Storage> {
        self
    }

    async fn log_action(&self, entry: LogEntry) -> Result<(), StorageError> {
        self.direct.log_action(entry).await
    }

    async fn get_log(&self) -> Result<ActionLog, StorageError> {
        self.direct.get_log().await
    }

    async fn apply_bulk_update(&self, update: BulkUpdate) -> Result<(), StorageError> {
        self.direct.apply_bulk_update(update).await
    }

    async fn load_user(&self, uuid: Uuid, username: Option<String>) -> Result<User, StorageError> {
        self.direct.load_user(uuid, username).await
    }

    async fn save_user(&self, user: User) -> Result<(), StorageError> {
        let key = BufferKey::User(user.uuid);
        self.flusher.discard_then(key, self.direct.save_user(user)).await
    }

    async fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError> {
        self.direct.get_unique_users().await
    }

    async fn get_users_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<Uuid>>, StorageError> {
        self.direct.get_users_with_permission(permission).await
    }

    async fn create_and_load_group(&self, name: String, cause: CreationCause) -> Result<Group, StorageError> {
        self.direct.create_and_load_group(name, cause).await
    }

    async fn load_group(&self, name: String) -> Result<Option<Group>, StorageError> {
        self.direct.load_group(name).await
    }

    async fn load_all_groups(&self) -> Result<Vec<Group>, StorageError> {
        self.direct.load_all_groups().await
    }

    async fn save_group(&self, group: Group) -> Result<(), StorageError> {
        let key = BufferKey::Group(normalize_name(&group.name));
        self.flusher.discard_then(key, self.direct.save_group(group)).await
    }

    async fn delete_group(&self, group: Group, cause: DeletionCause) -> Result<(), StorageError> {
        let key = BufferKey::Group(normalize_name(&group.name));
        self.flusher.discard_then(key, self.direct.delete_group(group, cause)).await
    }

    async fn get_groups_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<String>>, StorageError> {
        self.direct.get_groups_with_permission(permission).await
    }

    async fn create_and_load_track(&self, name: String, cause: CreationCause) -> Result<Track, StorageError> {
        self.direct.create_and_load_track(name, cause).await
    }

    async fn load_track(&self, name: String) -> Result<Option<Track>, StorageError> {
        self.direct.load_track(name).await
    }

    async fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError> {
        self.direct.load_all_tracks().await
    }

    async fn save_track(&self, track: Track) -> Result<(), StorageError> {
        let key = BufferKey::Track(normalize_name(&track.name));
        self.flusher.discard_then(key, self.direct.save_track(track)).await
    }

    async fn delete_track(&self, track: Track, cause: DeletionCause) -> Result<(), StorageError> {
        let key = BufferKey::Track(normalize_name(&track.name));
        self.flusher.discard_then(key, self.direct.delete_track(track, cause)).await
    }

    async fn save_uuid_data(&self, uuid: Uuid, username: String) -> Result<(), StorageError> {
        self.flusher
            .discard_then(BufferKey::UuidData(uuid), self.direct.save_uuid_data(uuid, username))
            .await
    }

    async fn get_uuid(&self, username: String) -> Result<Option<Uuid>, StorageError> {
        self.direct.get_uuid(username).await
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError> {
        self.direct.get_name(uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::AsyncStorage;
    use crate::entities::LoadedEntities;
    use crate::events::NoopDispatcher;
    use crate::model::Node;
    use crate::storage::memory::MemoryDriver;
    use crate::storage::traits::Driver;
    use std::time::Duration;

    fn buffered(window_ms: u64) -> (Arc<BufferedStorage>, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        let facade = Arc::new(AsyncStorage::new(
            driver.clone(),
            Arc::new(LoadedEntities::new()),
            Arc::new(NoopDispatcher),
            4,
        ));
        let config = StorageConfig {
            buffer_flush_ms: window_ms,
            flush_tick_ms: 5,
            ..Default::default()
        };
        (BufferedStorage::new(facade, &config), driver)
    }

    fn user_with(uuid: Uuid, perm: &str) -> User {
        let mut user = User::new(uuid, Some("steve".into()));
        user.nodes.push(Node::new(perm));
        user
    }

    #[tokio::test]
    async fn test_save_is_acknowledged_before_it_is_written() {
        let (storage, driver) = buffered(60_000);
        let uuid = Uuid::new_v4();

        storage.save_user(user_with(uuid, "a")).await.unwrap();
        assert_eq!(storage.pending(), 1);
        assert!(driver.stored_user(uuid).is_none());

        storage.force_flush().await;
        assert_eq!(storage.pending(), 0);
        assert!(driver.stored_user(uuid).is_some());
    }

    #[tokio::test]
    async fn test_last_write_wins_within_window() {
        let (storage, driver) = buffered(60_000);
        let uuid = Uuid::new_v4();

        for perm in ["one", "two", "three"] {
            storage.save_user(user_with(uuid, perm)).await.unwrap();
        }
        assert_eq!(storage.pending(), 1);

        storage.force_flush().await;
        let stored = driver.stored_user(uuid).unwrap();
        assert_eq!(stored.nodes.last().unwrap().permission, "three");
    }

    #[tokio::test]
    async fn test_background_task_flushes_after_window() {
        let (storage, driver) = buffered(20);
        let group = Group::new("builders");
        storage.save_group(group.clone()).await.unwrap();

        let flushed = tokio::time::timeout(Duration::from_secs(5), async {
            while driver.stored_group("builders").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(flushed.is_ok(), "buffered group never reached the driver");
        assert_eq!(storage.pending(), 0);
    }

    #[tokio::test]
    async fn test_reads_pass_through() {
        let (storage, driver) = buffered(60_000);
        driver.save_group(&Group::new("admin")).unwrap();
        assert!(storage.load_group("ADMIN".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_discards_pending_save() {
        let (storage, driver) = buffered(60_000);
        let group = storage
            .create_and_load_group("vip".into(), CreationCause::Command)
            .await
            .unwrap();

        let mut edited = group.clone();
        edited.nodes.push(Node::new("kit.vip"));
        storage.save_group(edited).await.unwrap();
        storage.delete_group(group, DeletionCause::Command).await.unwrap();
        assert_eq!(storage.pending(), 0);

        storage.force_flush().await;
        assert!(driver.stored_group("vip").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_rejects_later_writes() {
        let (storage, driver) = buffered(60_000);
        let uuid = Uuid::new_v4();
        storage.save_uuid_data(uuid, "Jeb_".into()).await.unwrap();

        storage.shutdown().await;
        assert_eq!(driver.get_uuid("jeb_").unwrap(), Some(uuid));

        let late = storage.save_user(user_with(uuid, "late")).await;
        assert_eq!(late, Err(StorageError::ShutDown));

        // Idempotent
        storage.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_buffer_writes_through() {
        let (storage, driver) = buffered(60_000);
        let direct = storage.clone().no_buffer();
        let uuid = Uuid::new_v4();

        direct.save_user(user_with(uuid, "x")).await.unwrap();
        assert!(driver.stored_user(uuid).is_some());
        assert_eq!(storage.pending(), 0);
    }

    #[tokio::test]
    async fn test_direct_save_supersedes_pending_save() {
        let (storage, driver) = buffered(60_000);
        let uuid = Uuid::new_v4();

        storage.save_user(user_with(uuid, "stale")).await.unwrap();
        storage.clone().no_buffer().save_user(user_with(uuid, "durable")).await.unwrap();
        assert_eq!(storage.pending(), 0);

        storage.force_flush().await;
        let stored = driver.stored_user(uuid).unwrap();
        assert_eq!(stored.nodes.last().unwrap().permission, "durable");
    }

    #[tokio::test]
    async fn test_direct_delete_is_not_undone_by_flush() {
        let (storage, driver) = buffered(60_000);
        let direct = storage.clone().no_buffer();
        let group = direct
            .create_and_load_group("builders".into(), CreationCause::Command)
            .await
            .unwrap();

        storage.save_group(group.clone()).await.unwrap();
        direct.delete_group(group, DeletionCause::Api).await.unwrap();

        storage.force_flush().await;
        assert!(driver.stored_group("builders").is_none());
    }

    #[test]
    fn test_key_display_and_kind() {
        let key = PendingWrite::Group(Group::new("Admin")).key();
        assert_eq!(key, BufferKey::Group("admin".into()));
        assert_eq!(key.to_string(), "group:admin");
        assert_eq!(key.kind(), DataKind::Group);
    }
}
