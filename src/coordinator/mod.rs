// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async storage stack.
//!
//! Three wrapper layers share the [`Storage`] contract and are composed over
//! one synchronous [`Driver`]:
//!
//! ```text
//! caller → PhasedStorage → BufferedStorage → AsyncStorage → Driver (maybe SplitDriver)
//!            phase gates     write coalescing   blocking pool      backend(s)
//!                                               + lifecycle events
//! ```
//!
//! Each layer owns the layer beneath it and delegates everything it does
//! not intercept.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use perms_storage::{MemoryDriver, Storage, StorageBuilder, StorageConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), perms_storage::StorageError> {
//! let storage = StorageBuilder::new(StorageConfig::default())
//!     .backend("memory", Arc::new(MemoryDriver::new()))
//!     .build()?;
//!
//! storage.init().await?;
//! let user = storage.load_user(uuid::Uuid::new_v4(), Some("Notch".into())).await?;
//! storage.save_user(user).await?; // buffered
//! storage.shutdown().await;       // flushes
//! # Ok(())
//! # }
//! ```

mod buffered;
mod facade;
mod phased;

pub use buffered::{BufferKey, BufferedStorage, PendingWrite};
pub use facade::AsyncStorage;
pub use phased::{PhaseGuard, PhasedStorage};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::bulk::BulkUpdate;
use crate::config::StorageConfig;
use crate::entities::{EntityLookup, LoadedEntities};
use crate::events::{CreationCause, DeletionCause, EventDispatcher, NoopDispatcher};
use crate::model::{ActionLog, Group, HeldPermission, LogEntry, Track, User};
use crate::storage::split::SplitDriver;
use crate::storage::traits::{Driver, Meta, StorageError};

/// Non-blocking storage contract shared by every layer of the stack.
///
/// Arguments are owned so that calls can be handed to worker threads or
/// parked in the write buffer.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Name of the underlying driver.
    fn name(&self) -> String;

    /// Diagnostics of the underlying driver.
    fn meta(&self) -> Meta;

    async fn init(&self) -> Result<(), StorageError>;

    /// Never fails; problems are logged.
    async fn shutdown(&self);

    /// The same stack without write buffering.
    fn no_buffer(self: Arc<Self>) -> Arc<dyn Storage>;

    /// Issue every buffered write now and wait for them.
    async fn force_flush(&self) {}

    async fn log_action(&self, entry: LogEntry) -> Result<(), StorageError>;
    async fn get_log(&self) -> Result<ActionLog, StorageError>;
    async fn apply_bulk_update(&self, update: BulkUpdate) -> Result<(), StorageError>;

    async fn load_user(&self, uuid: Uuid, username: Option<String>) -> Result<User, StorageError>;
    async fn save_user(&self, user: User) -> Result<(), StorageError>;
    async fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError>;
    async fn get_users_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<Uuid>>, StorageError>;

    async fn create_and_load_group(&self, name: String, cause: CreationCause) -> Result<Group, StorageError>;
    async fn load_group(&self, name: String) -> Result<Option<Group>, StorageError>;
    async fn load_all_groups(&self) -> Result<Vec<Group>, StorageError>;
    async fn save_group(&self, group: Group) -> Result<(), StorageError>;
    async fn delete_group(&self, group: Group, cause: DeletionCause) -> Result<(), StorageError>;
    async fn get_groups_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<String>>, StorageError>;

    async fn create_and_load_track(&self, name: String, cause: CreationCause) -> Result<Track, StorageError>;
    async fn load_track(&self, name: String) -> Result<Option<Track>, StorageError>;
    async fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError>;
    async fn save_track(&self, track: Track) -> Result<(), StorageError>;
    async fn delete_track(&self, track: Track, cause: DeletionCause) -> Result<(), StorageError>;

    async fn save_uuid_data(&self, uuid: Uuid, username: String) -> Result<(), StorageError>;
    async fn get_uuid(&self, username: String) -> Result<Option<Uuid>, StorageError>;
    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError>;
}

/// Assembles the full stack from named backends and a [`StorageConfig`].
///
/// With a `[split]` section every configured backend is routed through a
/// [`SplitDriver`]; without one exactly one backend must be registered.
pub struct StorageBuilder {
    config: StorageConfig,
    backends: HashMap<String, Arc<dyn Driver>>,
    entities: Arc<dyn EntityLookup>,
    events: Arc<dyn EventDispatcher>,
}

impl StorageBuilder {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            backends: HashMap::new(),
            entities: Arc::new(LoadedEntities::new()),
            events: Arc::new(NoopDispatcher),
        }
    }

    /// Register a backend. Names are matched case-insensitively against the
    /// split table.
    #[must_use]
    pub fn backend(mut self, name: &str, driver: Arc<dyn Driver>) -> Self {
        self.backends.insert(name.trim().to_lowercase(), driver);
        self
    }

    #[must_use]
    pub fn entities(mut self, entities: Arc<dyn EntityLookup>) -> Self {
        self.entities = entities;
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    /// Resolve the driver: a split router or the single registered backend.
    pub fn build_driver(&mut self) -> Result<Arc<dyn Driver>, StorageError> {
        let backends = std::mem::take(&mut self.backends);
        if let Some(split) = &self.config.split {
            let router = SplitDriver::new(backends, split.kind_map()?)?;
            info!(types = %router.types_description(), "Using split storage");
            return Ok(Arc::new(router));
        }

        let count = backends.len();
        match backends.into_values().next() {
            Some(driver) if count == 1 => Ok(driver),
            _ => Err(StorageError::Config(format!(
                "expected exactly one backend without a split table, got {}",
                count
            ))),
        }
    }

    /// Build `PhasedStorage(BufferedStorage(AsyncStorage(driver)))`.
    ///
    /// Must be called from within a tokio runtime: the write buffer spawns
    /// its flush task here.
    pub fn build(mut self) -> Result<Arc<PhasedStorage>, StorageError> {
        let driver = self.build_driver()?;
        let facade: Arc<dyn Storage> = Arc::new(AsyncStorage::new(
            driver,
            self.entities,
            self.events,
            self.config.worker_concurrency,
        ));
        let buffered: Arc<dyn Storage> = BufferedStorage::new(facade, &self.config);
        Ok(Arc::new(PhasedStorage::new(buffered, &self.config)))
    }
}
