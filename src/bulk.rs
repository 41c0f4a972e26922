// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Declarative bulk updates.
//!
//! A [`BulkUpdate`] selects every node of the targeted holders that passes
//! all constraints and either deletes it or rewrites one field. Drivers use
//! [`BulkUpdate::apply_to`] as the reference semantics; SQL-backed drivers
//! are free to translate the same query into a statement instead.
//!
//! # Example
//!
//! ```
//! use perms_storage::{BulkUpdate, BulkTarget, BulkAction, Comparison, Constraint, NodeField, Node};
//!
//! let update = BulkUpdate::new(
//!     BulkTarget::Groups,
//!     BulkAction::Update { field: NodeField::Server, value: Some("survival".into()) },
//! )
//! .with_constraint(Constraint::new(NodeField::Server, Comparison::Equal, "factions"));
//!
//! let node = Node::new("essentials.fly").with_server("factions");
//! let updated = update.apply_to(&node).unwrap();
//! assert_eq!(updated.server.as_deref(), Some("survival"));
//!
//! let untouched = Node::new("essentials.fly");
//! assert_eq!(update.apply_to(&untouched), Some(untouched.clone()));
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{DataKind, Node};

/// Which holders a bulk update runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkTarget {
    Users,
    Groups,
    /// Users and groups
    All,
}

impl BulkTarget {
    /// Data kinds touched, in lock-acquisition order (user before group).
    #[must_use]
    pub fn kinds(&self) -> &'static [DataKind] {
        match self {
            Self::Users => &[DataKind::User],
            Self::Groups => &[DataKind::Group],
            Self::All => &[DataKind::User, DataKind::Group],
        }
    }

    #[must_use]
    pub fn includes(&self, kind: DataKind) -> bool {
        self.kinds().contains(&kind)
    }
}

/// Node field addressed by constraints and update actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeField {
    Permission,
    Server,
    World,
}

impl NodeField {
    fn get<'a>(&self, node: &'a Node) -> Option<&'a str> {
        match self {
            Self::Permission => Some(node.permission.as_str()),
            Self::Server => node.server.as_deref(),
            Self::World => node.world.as_deref(),
        }
    }
}

/// Comparison operators: `==`, `!=`, `~~` (LIKE) and `!~` (NOT LIKE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    Equal,
    NotEqual,
    Similar,
    NotSimilar,
}

impl Comparison {
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Similar => "~~",
            Self::NotSimilar => "!~",
        }
    }

    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "==" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            "~~" => Some(Self::Similar),
            "!~" => Some(Self::NotSimilar),
            _ => None,
        }
    }

    fn matches(&self, actual: &str, expected: &str) -> bool {
        match self {
            Self::Equal => actual.eq_ignore_ascii_case(expected),
            Self::NotEqual => !actual.eq_ignore_ascii_case(expected),
            Self::Similar => like(actual, expected),
            Self::NotSimilar => !like(actual, expected),
        }
    }
}

/// A single `field <op> value` filter.
///
/// Unset server/world fields compare as `"global"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub field: NodeField,
    pub comparison: Comparison,
    pub value: String,
}

impl Constraint {
    pub fn new(field: NodeField, comparison: Comparison, value: impl Into<String>) -> Self {
        Self {
            field,
            comparison,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn eval(&self, node: &Node) -> bool {
        let actual = self.field.get(node).unwrap_or("global");
        self.comparison.matches(actual, &self.value)
    }
}

/// What happens to a matching node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkAction {
    Delete,
    /// Rewrite `field`. `None` clears server/world; it is ignored for the
    /// permission field, which cannot be empty.
    Update {
        field: NodeField,
        value: Option<String>,
    },
}

/// A declarative mutation applied across every matching record of a kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpdate {
    pub target: BulkTarget,
    pub action: BulkAction,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl BulkUpdate {
    pub fn new(target: BulkTarget, action: BulkAction) -> Self {
        Self {
            target,
            action,
            constraints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Whether every constraint accepts `node`.
    #[must_use]
    pub fn satisfies(&self, node: &Node) -> bool {
        self.constraints.iter().all(|c| c.eval(node))
    }

    /// Result of running the update over one node: `None` when the node is
    /// deleted, otherwise the (possibly rewritten) node.
    #[must_use]
    pub fn apply_to(&self, node: &Node) -> Option<Node> {
        if !self.satisfies(node) {
            return Some(node.clone());
        }
        match &self.action {
            BulkAction::Delete => None,
            BulkAction::Update { field, value } => {
                let mut updated = node.clone();
                match field {
                    NodeField::Permission => {
                        if let Some(v) = value {
                            updated.permission = v.clone();
                        }
                    }
                    NodeField::Server => updated.server = value.clone(),
                    NodeField::World => updated.world = value.clone(),
                }
                Some(updated)
            }
        }
    }

    /// Apply over a node list in place. Returns true if anything changed.
    pub fn apply_all(&self, nodes: &mut Vec<Node>) -> bool {
        let before = nodes.clone();
        *nodes = before.iter().filter_map(|n| self.apply_to(n)).collect();
        *nodes != before
    }
}

/// Case-insensitive SQL LIKE: `%` matches any run, `_` any single char.
fn like(input: &str, pattern: &str) -> bool {
    let input: Vec<char> = input.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

    // Iterative wildcard match with backtracking to the last '%'.
    let (mut i, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == input[i]) {
            i += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some((p, i));
            p += 1;
        } else if let Some((sp, si)) = star {
            p = sp + 1;
            i = si + 1;
            star = Some((sp, si + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
