// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashSet;

use thiserror::Error;
use uuid::Uuid;

use crate::bulk::BulkUpdate;
use crate::model::{ActionLog, DataKind, Group, HeldPermission, LogEntry, Track, User};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend '{backend}' error: {message}")]
    Backend { backend: String, message: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Failed to initialise backend(s): {}", failed.join(", "))]
    Init { failed: Vec<String> },
    #[error("Invalid storage configuration: {0}")]
    Config(String),
    #[error("A phase is already active on the {0} kind")]
    PhaseBusy(DataKind),
    #[error("Storage worker failed: {0}")]
    Worker(String),
    #[error("Storage has been shut down")]
    ShutDown,
}

impl StorageError {
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

/// Diagnostic key/value pairs, in display order.
pub type Meta = Vec<(String, String)>;

/// The blocking contract every physical backend implements.
///
/// Calls block the calling thread and report failures synchronously. No
/// events are emitted at this layer; see
/// [`AsyncStorage`](crate::coordinator::AsyncStorage) for that.
pub trait Driver: Send + Sync {
    /// Human-readable backend name (e.g. "H2", "MongoDB", "Memory").
    fn name(&self) -> &str;

    fn init(&self) -> Result<(), StorageError>;
    fn shutdown(&self) -> Result<(), StorageError>;

    fn meta(&self) -> Meta {
        vec![("Type".to_string(), self.name().to_string())]
    }

    fn log_action(&self, entry: &LogEntry) -> Result<(), StorageError>;
    fn get_log(&self) -> Result<ActionLog, StorageError>;

    /// Apply to every holder of this backend the update targets. Must be
    /// atomic per backend transaction boundary.
    fn apply_bulk_update(&self, update: &BulkUpdate) -> Result<(), StorageError>;

    /// Load a user, creating a default record if none is stored.
    fn load_user(&self, uuid: Uuid, username: Option<&str>) -> Result<User, StorageError>;
    fn save_user(&self, user: &User) -> Result<(), StorageError>;
    fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError>;
    fn get_users_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<Uuid>>, StorageError>;

    /// Load a group, creating it if absent.
    fn create_and_load_group(&self, name: &str) -> Result<Group, StorageError>;
    /// `None` if the group does not exist.
    fn load_group(&self, name: &str) -> Result<Option<Group>, StorageError>;
    fn load_all_groups(&self) -> Result<Vec<Group>, StorageError>;
    fn save_group(&self, group: &Group) -> Result<(), StorageError>;
    fn delete_group(&self, group: &Group) -> Result<(), StorageError>;
    fn get_groups_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<String>>, StorageError>;

    fn create_and_load_track(&self, name: &str) -> Result<Track, StorageError>;
    fn load_track(&self, name: &str) -> Result<Option<Track>, StorageError>;
    fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError>;
    fn save_track(&self, track: &Track) -> Result<(), StorageError>;
    fn delete_track(&self, track: &Track) -> Result<(), StorageError>;

    fn save_uuid_data(&self, uuid: Uuid, username: &str) -> Result<(), StorageError>;
    fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError>;
    fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError>;
}
