// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::bulk::BulkUpdate;
use crate::model::{normalize_name, ActionLog, DataKind, Group, HeldPermission, LogEntry, Track, User};
use super::traits::{Driver, Meta, StorageError};

/// Volatile driver keeping every record in concurrent maps.
///
/// Bulk updates take an exclusive transaction lock so they apply atomically
/// with respect to single-record writes on the same driver.
pub struct MemoryDriver {
    name: String,
    users: DashMap<Uuid, User>,
    groups: DashMap<String, Group>,
    tracks: DashMap<String, Track>,
    uuid_to_name: DashMap<Uuid, String>,
    name_to_uuid: DashMap<String, Uuid>,
    log: Mutex<ActionLog>,
    txn: RwLock<()>,
    running: AtomicBool,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::named("Memory")
    }

    /// A memory driver reporting `name` in diagnostics.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: DashMap::new(),
            groups: DashMap::new(),
            tracks: DashMap::new(),
            uuid_to_name: DashMap::new(),
            name_to_uuid: DashMap::new(),
            log: Mutex::new(ActionLog::new()),
            txn: RwLock::new(()),
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stored user record, without the create-on-load behaviour.
    #[must_use]
    pub fn stored_user(&self, uuid: Uuid) -> Option<User> {
        self.users.get(&uuid).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn stored_group(&self, name: &str) -> Option<Group> {
        self.groups.get(&normalize_name(name)).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn stored_track(&self, name: &str) -> Option<Track> {
        self.tracks.get(&normalize_name(name)).map(|r| r.value().clone())
    }

    /// Remove everything.
    pub fn clear(&self) {
        let _txn = self.txn.write();
        self.users.clear();
        self.groups.clear();
        self.tracks.clear();
        self.uuid_to_name.clear();
        self.name_to_uuid.clear();
        *self.log.lock() = ActionLog::new();
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<(), StorageError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), StorageError> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn meta(&self) -> Meta {
        vec![
            ("Type".to_string(), self.name.clone()),
            (format!("{} Users", self.name), self.users.len().to_string()),
            (format!("{} Groups", self.name), self.groups.len().to_string()),
            (format!("{} Tracks", self.name), self.tracks.len().to_string()),
        ]
    }

    fn log_action(&self, entry: &LogEntry) -> Result<(), StorageError> {
        self.log.lock().push(entry.clone());
        Ok(())
    }

    fn get_log(&self) -> Result<ActionLog, StorageError> {
        Ok(self.log.lock().clone())
    }

    fn apply_bulk_update(&self, update: &BulkUpdate) -> Result<(), StorageError> {
        let _txn = self.txn.write();
        if update.target.includes(DataKind::User) {
            for mut user in self.users.iter_mut() {
                update.apply_all(&mut user.nodes);
            }
        }
        if update.target.includes(DataKind::Group) {
            for mut group in self.groups.iter_mut() {
                update.apply_all(&mut group.nodes);
            }
        }
        Ok(())
    }

    fn load_user(&self, uuid: Uuid, username: Option<&str>) -> Result<User, StorageError> {
        let _txn = self.txn.read();
        let mut user = self
            .users
            .get(&uuid)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| User::new(uuid, None));
        if let Some(name) = username {
            user.username = Some(name.to_string());
        }
        Ok(user)
    }

    fn save_user(&self, user: &User) -> Result<(), StorageError> {
        let _txn = self.txn.read();
        if user.is_default() {
            // Default users are implied, not stored.
            self.users.remove(&user.uuid);
        } else {
            self.users.insert(user.uuid, user.clone());
        }
        Ok(())
    }

    fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError> {
        Ok(self.users.iter().map(|r| *r.key()).collect())
    }

    fn get_users_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<Uuid>>, StorageError> {
        Ok(self
            .users
            .iter()
            .flat_map(|r| {
                let holder = *r.key();
                r.value()
                    .nodes
                    .iter()
                    .filter(|n| n.permission.eq_ignore_ascii_case(permission))
                    .map(|n| HeldPermission { holder, node: n.clone() })
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    fn create_and_load_group(&self, name: &str) -> Result<Group, StorageError> {
        let _txn = self.txn.read();
        let key = normalize_name(name);
        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| Group::new(name))
            .value()
            .clone();
        Ok(group)
    }

    fn load_group(&self, name: &str) -> Result<Option<Group>, StorageError> {
        Ok(self.stored_group(name))
    }

    fn load_all_groups(&self) -> Result<Vec<Group>, StorageError> {
        let mut groups: Vec<Group> = self.groups.iter().map(|r| r.value().clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    fn save_group(&self, group: &Group) -> Result<(), StorageError> {
        let _txn = self.txn.read();
        self.groups.insert(normalize_name(&group.name), group.clone());
        Ok(())
    }

    fn delete_group(&self, group: &Group) -> Result<(), StorageError> {
        let _txn = self.txn.read();
        self.groups
            .remove(&normalize_name(&group.name))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("group '{}'", group.name)))
    }

    fn get_groups_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<String>>, StorageError> {
        Ok(self
            .groups
            .iter()
            .flat_map(|r| {
                let holder = r.key().clone();
                r.value()
                    .nodes
                    .iter()
                    .filter(|n| n.permission.eq_ignore_ascii_case(permission))
                    .map(|n| HeldPermission { holder: holder.clone(), node: n.clone() })
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    fn create_and_load_track(&self, name: &str) -> Result<Track, StorageError> {
        let key = normalize_name(name);
        let track = self
            .tracks
            .entry(key)
            .or_insert_with(|| Track::new(name, Vec::new()))
            .value()
            .clone();
        Ok(track)
    }

    fn load_track(&self, name: &str) -> Result<Option<Track>, StorageError> {
        Ok(self.stored_track(name))
    }

    fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError> {
        let mut tracks: Vec<Track> = self.tracks.iter().map(|r| r.value().clone()).collect();
        tracks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tracks)
    }

    fn save_track(&self, track: &Track) -> Result<(), StorageError> {
        self.tracks.insert(normalize_name(&track.name), track.clone());
        Ok(())
    }

    fn delete_track(&self, track: &Track) -> Result<(), StorageError> {
        self.tracks
            .remove(&normalize_name(&track.name))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("track '{}'", track.name)))
    }

    fn save_uuid_data(&self, uuid: Uuid, username: &str) -> Result<(), StorageError> {
        let key = username.to_lowercase();
        if let Some(old) = self.uuid_to_name.insert(uuid, username.to_string()) {
            let old_key = old.to_lowercase();
            if old_key != key {
                self.name_to_uuid.remove_if(&old_key, |_, owner| *owner == uuid);
            }
        }
        self.name_to_uuid.insert(key, uuid);
        Ok(())
    }

    fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError> {
        Ok(self.name_to_uuid.get(&username.to_lowercase()).map(|r| *r.value()))
    }

    fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError> {
        Ok(self.uuid_to_name.get(&uuid).map(|r| r.value().clone()))
    }
}
