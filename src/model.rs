// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity records that flow through the storage layers.
//!
//! These are plain data: the authoritative live instances are held by an
//! external entity manager (see [`crate::entities`]). Drivers read and
//! write these records, the async layers move them between threads.
//!
//! # Example
//!
//! ```
//! use perms_storage::{Group, Node, Track};
//!
//! let mut admin = Group::new("Admin");
//! assert_eq!(admin.name, "admin"); // names are case-insensitive
//!
//! admin.nodes.push(Node::new("group.mod"));
//! assert_eq!(admin.parents(), vec!["mod".to_string()]);
//!
//! let staff = Track::new("staff", vec!["helper".into(), "mod".into(), "admin".into()]);
//! assert_eq!(staff.promote("mod"), Some("admin"));
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::traits::StorageError;

/// Name of the group every new user starts in.
pub const DEFAULT_GROUP: &str = "default";

/// Prefix of permission nodes that express group inheritance.
const GROUP_NODE_PREFIX: &str = "group.";

/// Data kinds the split router can send to different backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    User,
    Group,
    Track,
    Uuid,
    Log,
}

impl DataKind {
    /// Every kind, in routing-table order.
    pub const ALL: [DataKind; 5] = [
        DataKind::User,
        DataKind::Group,
        DataKind::Track,
        DataKind::Uuid,
        DataKind::Log,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Track => "track",
            Self::Uuid => "uuid",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            "track" => Ok(Self::Track),
            "uuid" => Ok(Self::Uuid),
            "log" => Ok(Self::Log),
            other => Err(StorageError::Config(format!("unknown data kind '{}'", other))),
        }
    }
}

/// A single permission assignment, optionally scoped by server/world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub permission: String,
    pub value: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<String>,
    /// Expiry as epoch seconds; `None` means permanent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
}

impl Node {
    /// A permanent, global, `true` node.
    pub fn new(permission: impl Into<String>) -> Self {
        Self {
            permission: permission.into(),
            value: true,
            server: None,
            world: None,
            expiry: None,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: bool) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    #[must_use]
    pub fn with_world(mut self, world: impl Into<String>) -> Self {
        self.world = Some(world.into());
        self
    }

    /// Group name if this node is an inheritance node (`group.<name>`).
    #[must_use]
    pub fn group_name(&self) -> Option<&str> {
        self.permission
            .strip_prefix(GROUP_NODE_PREFIX)
            .filter(|name| !name.is_empty())
    }
}

/// A user, identified by UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uuid: Uuid,
    /// Last known username, if any
    pub username: Option<String>,
    pub primary_group: String,
    pub nodes: Vec<Node>,
}

impl User {
    /// A fresh user record in the default group.
    pub fn new(uuid: Uuid, username: Option<String>) -> Self {
        Self {
            uuid,
            username,
            primary_group: DEFAULT_GROUP.to_string(),
            nodes: vec![Node::new(format!("{}{}", GROUP_NODE_PREFIX, DEFAULT_GROUP))],
        }
    }

    /// Whether this user carries nothing beyond the defaults.
    ///
    /// Drivers may skip persisting such users.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.primary_group == DEFAULT_GROUP
            && self.nodes.len() == 1
            && self.nodes[0].group_name() == Some(DEFAULT_GROUP)
            && self.nodes[0].value
    }
}

/// A named group. Names are case-insensitive and stored lower case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize_name(name),
            nodes: Vec::new(),
        }
    }

    /// Names of the groups this group inherits from.
    #[must_use]
    pub fn parents(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.value)
            .filter_map(|n| n.group_name())
            .map(normalize_name)
            .collect()
    }
}

/// An ordered promotion ladder of group names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub groups: Vec<String>,
}

impl Track {
    pub fn new(name: &str, groups: Vec<String>) -> Self {
        Self {
            name: normalize_name(name),
            groups: groups.iter().map(|g| normalize_name(g)).collect(),
        }
    }

    /// The group after `current`, if `current` is on the track and not last.
    #[must_use]
    pub fn promote(&self, current: &str) -> Option<&str> {
        let idx = self.position(current)?;
        self.groups.get(idx + 1).map(String::as_str)
    }

    /// The group before `current`, if `current` is on the track and not first.
    #[must_use]
    pub fn demote(&self, current: &str) -> Option<&str> {
        let idx = self.position(current)?;
        idx.checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .map(String::as_str)
    }

    fn position(&self, group: &str) -> Option<usize> {
        let group = normalize_name(group);
        self.groups.iter().position(|g| *g == group)
    }
}

/// A reverse-lookup hit: `holder` directly holds `node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldPermission<K> {
    pub holder: K,
    pub node: Node,
}

/// What an audit entry acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActedType {
    User,
    Group,
    Track,
}

/// Immutable record of an administrative action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Epoch seconds
    pub timestamp: i64,
    pub actor: Uuid,
    pub actor_name: String,
    pub acted_type: ActedType,
    /// Set when the acted-upon entity is a user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acted: Option<Uuid>,
    pub acted_name: String,
    pub action: String,
}

impl LogEntry {
    /// Entry stamped with the current time.
    pub fn now(
        actor: Uuid,
        actor_name: impl Into<String>,
        acted_type: ActedType,
        acted_name: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: epoch_secs(),
            actor,
            actor_name: actor_name.into(),
            acted_type,
            acted: None,
            acted_name: acted_name.into(),
            action: action.into(),
        }
    }
}

/// The audit log, ordered by timestamp (stable for equal timestamps).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLog {
    entries: Vec<LogEntry>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping timestamp order.
    pub fn push(&mut self, entry: LogEntry) {
        let idx = self
            .entries
            .partition_point(|e| e.timestamp <= entry.timestamp);
        self.entries.insert(idx, entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose acted-upon user is `uuid`.
    pub fn for_user(&self, uuid: Uuid) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.acted == Some(uuid))
    }

    /// Distinct actors that appear in the log.
    #[must_use]
    pub fn actors(&self) -> HashSet<Uuid> {
        self.entries.iter().map(|e| e.actor).collect()
    }
}

impl FromIterator<LogEntry> for ActionLog {
    fn from_iter<I: IntoIterator<Item = LogEntry>>(iter: I) -> Self {
        let mut log = ActionLog::new();
        for entry in iter {
            log.push(entry);
        }
        log
    }
}

/// Lower-case form used for group and track identity.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
