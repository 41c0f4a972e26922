// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only view of the live entity manager.
//!
//! The storage layers never create or evict live entities; they only ask
//! whether one is currently held so that lifecycle events have a subject.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::model::{normalize_name, Group, Track, User};

/// `get_if_loaded` for each entity kind.
pub trait EntityLookup: Send + Sync {
    fn user_if_loaded(&self, uuid: Uuid) -> Option<Arc<User>>;
    fn group_if_loaded(&self, name: &str) -> Option<Arc<Group>>;
    fn track_if_loaded(&self, name: &str) -> Option<Arc<Track>>;
}

/// Concurrent in-memory entity manager.
#[derive(Default)]
pub struct LoadedEntities {
    users: DashMap<Uuid, Arc<User>>,
    groups: DashMap<String, Arc<Group>>,
    tracks: DashMap<String, Arc<Track>>,
}

impl LoadedEntities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) -> Arc<User> {
        let user = Arc::new(user);
        self.users.insert(user.uuid, user.clone());
        user
    }

    pub fn insert_group(&self, group: Group) -> Arc<Group> {
        let group = Arc::new(group);
        self.groups.insert(normalize_name(&group.name), group.clone());
        group
    }

    pub fn insert_track(&self, track: Track) -> Arc<Track> {
        let track = Arc::new(track);
        self.tracks.insert(normalize_name(&track.name), track.clone());
        track
    }

    pub fn unload_user(&self, uuid: Uuid) -> Option<Arc<User>> {
        self.users.remove(&uuid).map(|(_, u)| u)
    }

    pub fn unload_group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.remove(&normalize_name(name)).map(|(_, g)| g)
    }

    pub fn unload_track(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.remove(&normalize_name(name)).map(|(_, t)| t)
    }
}

impl EntityLookup for LoadedEntities {
    fn user_if_loaded(&self, uuid: Uuid) -> Option<Arc<User>> {
        self.users.get(&uuid).map(|r| r.value().clone())
    }

    fn group_if_loaded(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(&normalize_name(name)).map(|r| r.value().clone())
    }

    fn track_if_loaded(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.get(&normalize_name(name)).map(|r| r.value().clone())
    }
}
