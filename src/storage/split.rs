// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Split routing: one [`Driver`] facade over several named backends.
//!
//! Each operation is sent to the backend configured for its data kind.
//! Both maps are fixed at construction, so lookups need no locking.
//!
//! # Lifecycle policy
//!
//! - `init` initialises every distinct backend in name order. If any fail the
//!   whole router fails with [`StorageError::Init`] naming them; backends that
//!   did start are left running (they may be shared with other consumers) and
//!   are cleaned up by the normal `shutdown`.
//! - `shutdown` runs in reverse init order, attempts every backend regardless
//!   of earlier failures, logs failures, and is a no-op after the first call.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bulk::BulkUpdate;
use crate::model::{ActionLog, DataKind, Group, HeldPermission, LogEntry, Track, User};
use super::traits::{Driver, Meta, StorageError};

pub struct SplitDriver {
    backing: BTreeMap<String, Arc<dyn Driver>>,
    types: BTreeMap<DataKind, String>,
    shut_down: AtomicBool,
}

impl SplitDriver {
    /// Build a router. Fails unless every [`DataKind`] maps to a backend
    /// present in `backing`.
    pub fn new(
        backing: HashMap<String, Arc<dyn Driver>>,
        types: HashMap<DataKind, String>,
    ) -> Result<Self, StorageError> {
        for kind in DataKind::ALL {
            match types.get(&kind) {
                None => {
                    return Err(StorageError::Config(format!(
                        "no backend configured for the {} kind",
                        kind
                    )))
                }
                Some(name) if !backing.contains_key(name) => {
                    return Err(StorageError::Config(format!(
                        "{} kind routed to unknown backend '{}'",
                        kind, name
                    )))
                }
                Some(_) => {}
            }
        }

        let used: HashSet<&String> = types.values().collect();
        for name in backing.keys().filter(|n| !used.contains(n)) {
            warn!(backend = %name, "Split backend is configured but serves no data kind");
        }

        Ok(Self {
            backing: backing.into_iter().collect(),
            types: types.into_iter().collect(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Backend name serving `kind`.
    #[must_use]
    pub fn backend_name(&self, kind: DataKind) -> &str {
        self.types.get(&kind).map(String::as_str).unwrap_or_default()
    }

    /// The `{user=a, group=b, ...}` routing table as shown in diagnostics.
    #[must_use]
    pub fn types_description(&self) -> String {
        let parts: Vec<String> = self
            .types
            .iter()
            .map(|(kind, backend)| format!("{}={}", kind, backend))
            .collect();
        format!("{{{}}}", parts.join(", "))
    }

    fn route(&self, kind: DataKind) -> &dyn Driver {
        // Totality is checked in new(), and neither map changes afterwards.
        let name = &self.types[&kind];
        self.backing[name].as_ref()
    }

    /// Distinct backends, in name order, that `update` must run against.
    fn bulk_backends(&self, update: &BulkUpdate) -> BTreeSet<&str> {
        update
            .target
            .kinds()
            .iter()
            .map(|kind| self.types[kind].as_str())
            .collect()
    }
}

impl Driver for SplitDriver {
    fn name(&self) -> &str {
        "Split Storage"
    }

    #[tracing::instrument(skip(self), fields(backends = self.backing.len()))]
    fn init(&self) -> Result<(), StorageError> {
        let mut failed = Vec::new();
        for (name, backend) in &self.backing {
            match backend.init() {
                Ok(()) => {
                    info!(backend = %name, driver = backend.name(), "Split backend initialised");
                    crate::metrics::set_backend_running(name, true);
                }
                Err(e) => {
                    error!(backend = %name, error = %e, "Split backend failed to initialise");
                    crate::metrics::record_backend_failure(name, "init");
                    failed.push(name.clone());
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Init { failed })
        }
    }

    #[tracing::instrument(skip(self))]
    fn shutdown(&self) -> Result<(), StorageError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Split storage already shut down");
            return Ok(());
        }
        for (name, backend) in self.backing.iter().rev() {
            crate::metrics::set_backend_running(name, false);
            if let Err(e) = backend.shutdown() {
                warn!(backend = %name, error = %e, "Split backend failed to shut down");
                crate::metrics::record_backend_failure(name, "shutdown");
            }
        }
        Ok(())
    }

    fn meta(&self) -> Meta {
        let mut meta = vec![("Types".to_string(), self.types_description())];
        for backend in self.backing.values() {
            meta.extend(backend.meta());
        }
        meta
    }

    fn log_action(&self, entry: &LogEntry) -> Result<(), StorageError> {
        self.route(DataKind::Log).log_action(entry)
    }

    fn get_log(&self) -> Result<ActionLog, StorageError> {
        self.route(DataKind::Log).get_log()
    }

    /// Runs against the backend of every targeted kind, once per distinct
    /// backend. Every backend is attempted; any failure fails the whole
    /// update, and successful applications are not rolled back.
    fn apply_bulk_update(&self, update: &BulkUpdate) -> Result<(), StorageError> {
        let mut first_err = None;
        for name in self.bulk_backends(update) {
            if let Err(e) = self.backing[name].apply_bulk_update(update) {
                warn!(backend = %name, error = %e, "Bulk update failed on split backend");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn load_user(&self, uuid: Uuid, username: Option<&str>) -> Result<User, StorageError> {
        self.route(DataKind::User).load_user(uuid, username)
    }

    fn save_user(&self, user: &User) -> Result<(), StorageError> {
        self.route(DataKind::User).save_user(user)
    }

    fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError> {
        self.route(DataKind::User).get_unique_users()
    }

    fn get_users_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<Uuid>>, StorageError> {
        self.route(DataKind::User).get_users_with_permission(permission)
    }

    fn create_and_load_group(&self, name: &str) -> Result<Group, StorageError> {
        self.route(DataKind::Group).create_and_load_group(name)
    }

    fn load_group(&self, name: &str) -> Result<Option<Group>, StorageError> {
        self.route(DataKind::Group).load_group(name)
    }

    fn load_all_groups(&self) -> Result<Vec<Group>, StorageError> {
        self.route(DataKind::Group).load_all_groups()
    }

    fn save_group(&self, group: &Group) -> Result<(), StorageError> {
        self.route(DataKind::Group).save_group(group)
    }

    fn delete_group(&self, group: &Group) -> Result<(), StorageError> {
        self.route(DataKind::Group).delete_group(group)
    }

    fn get_groups_with_permission(&self, permission: &str) -> Result<Vec<HeldPermission<String>>, StorageError> {
        self.route(DataKind::Group).get_groups_with_permission(permission)
    }

    fn create_and_load_track(&self, name: &str) -> Result<Track, StorageError> {
        self.route(DataKind::Track).create_and_load_track(name)
    }

    fn load_track(&self, name: &str) -> Result<Option<Track>, StorageError> {
        self.route(DataKind::Track).load_track(name)
    }

    fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError> {
        self.route(DataKind::Track).load_all_tracks()
    }

    fn save_track(&self, track: &Track) -> Result<(), StorageError> {
        self.route(DataKind::Track).save_track(track)
    }

    fn delete_track(&self, track: &Track) -> Result<(), StorageError> {
        self.route(DataKind::Track).delete_track(track)
    }

    fn save_uuid_data(&self, uuid: Uuid, username: &str) -> Result<(), StorageError> {
        self.route(DataKind::Uuid).save_uuid_data(uuid, username)
    }

    fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError> {
        self.route(DataKind::Uuid).get_uuid(username)
    }

    fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError> {
        self.route(DataKind::Uuid).get_name(uuid)
    }
}
