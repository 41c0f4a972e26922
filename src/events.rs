// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifecycle events emitted by [`AsyncStorage`](crate::coordinator::AsyncStorage).
//!
//! Delivery semantics belong to the [`EventDispatcher`] implementation. The
//! bundled [`BroadcastDispatcher`] fans events out over a tokio broadcast
//! channel and drops them when nobody is subscribed.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{Group, Track, User};

/// Why an entity was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreationCause {
    Command,
    Api,
    Internal,
}

/// Why an entity was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionCause {
    Command,
    Api,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    UserLoaded(Arc<User>),
    GroupCreated { group: Arc<Group>, cause: CreationCause },
    GroupLoaded(Arc<Group>),
    GroupDeleted { group: Group, cause: DeletionCause },
    TrackCreated { track: Arc<Track>, cause: CreationCause },
    TrackLoaded(Arc<Track>),
    TrackDeleted { track: Track, cause: DeletionCause },
    AllGroupsLoaded,
    AllTracksLoaded,
}

impl StorageEvent {
    /// Stable event name, e.g. `group-created`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserLoaded(_) => "user-loaded",
            Self::GroupCreated { .. } => "group-created",
            Self::GroupLoaded(_) => "group-loaded",
            Self::GroupDeleted { .. } => "group-deleted",
            Self::TrackCreated { .. } => "track-created",
            Self::TrackLoaded(_) => "track-loaded",
            Self::TrackDeleted { .. } => "track-deleted",
            Self::AllGroupsLoaded => "all-groups-loaded",
            Self::AllTracksLoaded => "all-tracks-loaded",
        }
    }
}

impl fmt::Display for StorageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Accepts lifecycle events. Called on the caller's async task once the
/// driver call has returned, so implementations must not block.
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: StorageEvent);
}

/// Dispatcher that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

impl EventDispatcher for NoopDispatcher {
    fn dispatch(&self, _event: StorageEvent) {}
}

/// Fan-out over a bounded tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    tx: broadcast::Sender<StorageEvent>,
}

impl BroadcastDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }
}

impl EventDispatcher for BroadcastDispatcher {
    fn dispatch(&self, event: StorageEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(event = kind, "No event subscribers");
        }
    }
}
