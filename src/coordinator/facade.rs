// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async facade over a blocking [`Driver`].
//!
//! Every driver call runs on tokio's blocking pool, bounded by a semaphore,
//! so the caller's task only ever awaits. Successful loads and creations are
//! announced through the [`EventDispatcher`], but only when the entity
//! manager currently holds a live instance of the entity.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bulk::BulkUpdate;
use crate::entities::EntityLookup;
use crate::events::{CreationCause, DeletionCause, EventDispatcher, StorageEvent};
use crate::model::{ActionLog, Group, HeldPermission, LogEntry, Track, User};
use crate::storage::traits::{Driver, Meta, StorageError};

use super::Storage;

pub struct AsyncStorage {
    driver: Arc<dyn Driver>,
    entities: Arc<dyn EntityLookup>,
    events: Arc<dyn EventDispatcher>,
    /// Limits concurrent driver calls on the blocking pool
    workers: Arc<Semaphore>,
}

impl AsyncStorage {
    pub fn new(
        driver: Arc<dyn Driver>,
        entities: Arc<dyn EntityLookup>,
        events: Arc<dyn EventDispatcher>,
        worker_concurrency: usize,
    ) -> Self {
        Self {
            driver,
            entities,
            events,
            workers: Arc::new(Semaphore::new(worker_concurrency.max(1))),
        }
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Run `call` against the driver on the blocking pool.
    async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        F: FnOnce(&dyn Driver) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let queued = Instant::now();
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::ShutDown)?;
        crate::metrics::record_queue_wait(queued.elapsed());

        let driver = self.driver.clone();
        let started = Instant::now();
        let result = match tokio::task::spawn_blocking(move || call(driver.as_ref())).await {
            Ok(result) => result,
            Err(e) => {
                error!(operation, error = %e, "Storage worker task failed");
                Err(StorageError::Worker(e.to_string()))
            }
        };
        crate::metrics::record_latency(operation, started.elapsed());

        match &result {
            Ok(_) => crate::metrics::record_operation("facade", operation, "success"),
            Err(e) => {
                debug!(operation, error = %e, "Driver call failed");
                crate::metrics::record_operation("facade", operation, "error");
            }
        }
        result
    }

    fn emit(&self, event: StorageEvent) {
        crate::metrics::record_event(event.kind());
        self.events.dispatch(event);
    }
}

#[async_trait]
impl Storage for AsyncStorage {
    fn name(&self) -> String {
        self.driver.name().to_string()
    }

    fn meta(&self) -> Meta {
        self.driver.meta()
    }

    #[tracing::instrument(skip(self))]
    async fn init(&self) -> Result<(), StorageError> {
        match self.run("init", |d| d.init()).await {
            Ok(()) => {
                info!(driver = self.driver.name(), "Storage driver initialised");
                Ok(())
            }
            Err(e) => {
                error!(driver = self.driver.name(), error = %e, "Failed to initialise storage driver");
                Err(e)
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn shutdown(&self) {
        match self.run("shutdown", |d| d.shutdown()).await {
            Ok(()) => info!(driver = self.driver.name(), "Storage driver shut down"),
            Err(e) => warn!(driver = self.driver.name(), error = %e, "Error while shutting down storage driver"),
        }
    }

    fn no_buffer(self: Arc<Self>) -> Arc<dyn Storage> {
        self
    }

    async fn log_action(&self, entry: LogEntry) -> Result<(), StorageError> {
        self.run("log_action", move |d| d.log_action(&entry)).await
    }

    async fn get_log(&self) -> Result<ActionLog, StorageError> {
        self.run("get_log", |d| d.get_log()).await
    }

    async fn apply_bulk_update(&self, update: BulkUpdate) -> Result<(), StorageError> {
        self.run("apply_bulk_update", move |d| d.apply_bulk_update(&update)).await
    }

    async fn load_user(&self, uuid: Uuid, username: Option<String>) -> Result<User, StorageError> {
        let user = self
            .run("load_user", move |d| d.load_user(uuid, username.as_deref()))
            .await?;
        if let Some(live) = self.entities.user_if_loaded(uuid) {
            self.emit(StorageEvent::UserLoaded(live));
        }
        Ok(user)
    }

    async fn save_user(&self, user: User) -> Result<(), StorageError> {
        self.run("save_user", move |d| d.save_user(&user)).await
    }

    async fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError> {
        self.run("get_unique_users", |d| d.get_unique_users()).await
    }

    async fn get_users_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<Uuid>>, StorageError> {
        self.run("get_users_with_permission", move |d| d.get_users_with_permission(&permission))
            .await
    }

    async fn create_and_load_group(&self, name: String, cause: CreationCause) -> Result<Group, StorageError> {
        let group = self
            .run("create_and_load_group", move |d| d.create_and_load_group(&name))
            .await?;
        if let Some(live) = self.entities.group_if_loaded(&group.name) {
            self.emit(StorageEvent::GroupCreated { group: live, cause });
        }
        Ok(group)
    }

    async fn load_group(&self, name: String) -> Result<Option<Group>, StorageError> {
        let group = self.run("load_group", move |d| d.load_group(&name)).await?;
        if let Some(live) = group.as_ref().and_then(|g| self.entities.group_if_loaded(&g.name)) {
            self.emit(StorageEvent::GroupLoaded(live));
        }
        Ok(group)
    }

    async fn load_all_groups(&self) -> Result<Vec<Group>, StorageError> {
        let groups = self.run("load_all_groups", |d| d.load_all_groups()).await?;
        self.emit(StorageEvent::AllGroupsLoaded);
        Ok(groups)
    }

    async fn save_group(&self, group: Group) -> Result<(), StorageError> {
        self.run("save_group", move |d| d.save_group(&group)).await
    }

    async fn delete_group(&self, group: Group, cause: DeletionCause) -> Result<(), StorageError> {
        let target = group.clone();
        self.run("delete_group", move |d| d.delete_group(&target)).await?;
        self.emit(StorageEvent::GroupDeleted { group, cause });
        Ok(())
    }

    async fn get_groups_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<String>>, StorageError> {
        self.run("get_groups_with_permission", move |d| d.get_groups_with_permission(&permission))
            .await
    }

    async fn create_and_load_track(&self, name: String, cause: CreationCause) -> Result<Track, StorageError> {
        let track = self
            .run("create_and_load_track", move |d| d.create_and_load_track(&name))
            .await?;
        if let Some(live) = self.entities.track_if_loaded(&track.name) {
            self.emit(StorageEvent::TrackCreated { track: live, cause });
        }
        Ok(track)
    }

    async fn load_track(&self, name: String) -> Result<Option<Track>, StorageError> {
        let track = self.run("load_track", move |d| d.load_track(&name)).await?;
        if let Some(live) = track.as_ref().and_then(|t| self.entities.track_if_loaded(&t.name)) {
            self.emit(StorageEvent::TrackLoaded(live));
        }
        Ok(track)
    }

    async fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError> {
        let tracks = self.run("load_all_tracks", |d| d.load_all_tracks()).await?;
        self.emit(StorageEvent::AllTracksLoaded);
        Ok(tracks)
    }

    async fn save_track(&self, track: Track) -> Result<(), StorageError> {
        self.run("save_track", move |d| d.save_track(&track)).await
    }

    async fn delete_track(&self, track: Track, cause: DeletionCause) -> Result<(), StorageError> {
        let target = track.clone();
        self.run("delete_track", move |d| d.delete_track(&target)).await?;
        self.emit(StorageEvent::TrackDeleted { track, cause });
        Ok(())
    }

    async fn save_uuid_data(&self, uuid: Uuid, username: String) -> Result<(), StorageError> {
        self.run("save_uuid_data", move |d| d.save_uuid_data(uuid, &username)).await
    }

    async fn get_uuid(&self, username: String) -> Result<Option<Uuid>, StorageError> {
        self.run("get_uuid", move |d| d.get_uuid(&username)).await
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError> {
        self.run("get_name", move |d| d.get_name(uuid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::LoadedEntities;
    use crate::events::BroadcastDispatcher;
    use crate::storage::memory::MemoryDriver;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        storage: AsyncStorage,
        entities: Arc<LoadedEntities>,
        events: tokio::sync::broadcast::Receiver<StorageEvent>,
        driver: Arc<MemoryDriver>,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(MemoryDriver::new());
        let entities = Arc::new(LoadedEntities::new());
        let dispatcher = BroadcastDispatcher::new(32);
        let events = dispatcher.subscribe();
        let storage = AsyncStorage::new(driver.clone(), entities.clone(), Arc::new(dispatcher), 4);
        Fixture { storage, entities, events, driver }
    }

    #[tokio::test]
    async fn test_load_without_live_instance_emits_nothing() {
        let mut f = fixture();
        let uuid = Uuid::new_v4();
        let user = f.storage.load_user(uuid, Some("Notch".into())).await.unwrap();
        assert_eq!(user.uuid, uuid);
        assert_eq!(f.events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_load_with_live_instance_emits_once() {
        let mut f = fixture();
        let uuid = Uuid::new_v4();
        let live = f.entities.insert_user(User::new(uuid, None));

        f.storage.load_user(uuid, None).await.unwrap();
        assert_eq!(f.events.try_recv().unwrap(), StorageEvent::UserLoaded(live));
        assert_eq!(f.events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_group_create_and_load_events() {
        let mut f = fixture();
        f.entities.insert_group(Group::new("admin"));

        f.storage
            .create_and_load_group("Admin".into(), CreationCause::Command)
            .await
            .unwrap();
        assert!(matches!(
            f.events.try_recv().unwrap(),
            StorageEvent::GroupCreated { cause: CreationCause::Command, .. }
        ));

        let loaded = f.storage.load_group("admin".into()).await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(f.events.try_recv().unwrap().kind(), "group-loaded");

        // Missing group: no event
        assert!(f.storage.load_group("ghost".into()).await.unwrap().is_none());
        assert_eq!(f.events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_delete_emits_with_callers_entity() {
        let mut f = fixture();
        let group = f
            .storage
            .create_and_load_group("mod".into(), CreationCause::Api)
            .await
            .unwrap();

        f.storage.delete_group(group.clone(), DeletionCause::Api).await.unwrap();
        assert_eq!(
            f.events.try_recv().unwrap(),
            StorageEvent::GroupDeleted { group, cause: DeletionCause::Api }
        );
        assert!(f.driver.stored_group("mod").is_none());
    }

    #[tokio::test]
    async fn test_failed_delete_emits_nothing() {
        let mut f = fixture();
        let result = f.storage.delete_track(Track::new("ghost", vec![]), DeletionCause::Command).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(f.events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_load_all_events_fire_unconditionally() {
        let mut f = fixture();
        assert!(f.storage.load_all_groups().await.unwrap().is_empty());
        assert!(f.storage.load_all_tracks().await.unwrap().is_empty());
        assert_eq!(f.events.try_recv().unwrap(), StorageEvent::AllGroupsLoaded);
        assert_eq!(f.events.try_recv().unwrap(), StorageEvent::AllTracksLoaded);
    }

    #[tokio::test]
    async fn test_uuid_round_trip() {
        let f = fixture();
        let uuid = Uuid::new_v4();
        f.storage.save_uuid_data(uuid, "Dinnerbone".into()).await.unwrap();
        assert_eq!(f.storage.get_uuid("dinnerbone".into()).await.unwrap(), Some(uuid));
        assert_eq!(f.storage.get_name(uuid).await.unwrap().as_deref(), Some("Dinnerbone"));
    }

    #[tokio::test]
    async fn test_init_and_shutdown() {
        let f = fixture();
        f.storage.init().await.unwrap();
        assert!(f.driver.is_running());
        f.storage.shutdown().await;
        assert!(!f.driver.is_running());
        // Second shutdown is harmless
        f.storage.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_calls_share_the_pool() {
        let f = fixture();
        let storage = Arc::new(f.storage);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    storage.save_uuid_data(Uuid::new_v4(), format!("player{}", i)).await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(f.driver.meta().len(), 4);
    }
}
