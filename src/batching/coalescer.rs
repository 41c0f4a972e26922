// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-write-wins coalescing of pending writes.
//!
//! The [`Coalescer`] keeps at most one pending value per key. Pushing a key
//! that is already pending replaces its value but keeps its original queue
//! time, so no write waits longer than one flush window however often it is
//! overwritten. Writers and the flusher may run concurrently: a value stays
//! replaceable until the flusher removes it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use perms_storage::{Coalescer, FlushReason};
//!
//! let buffer: Coalescer<&str, u32> = Coalescer::new(Duration::from_millis(250));
//! assert!(!buffer.push("user-1", 1));
//! assert!(buffer.push("user-1", 2)); // replaced
//! assert_eq!(buffer.len(), 1);
//!
//! let batch = buffer.force_flush_with_reason(FlushReason::Manual).unwrap();
//! assert_eq!(batch.items, vec![("user-1", 2)]);
//! assert!(buffer.is_empty());
//! ```

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Pending writes outlived the flush window
    Time,
    /// Manual flush requested
    Manual,
    /// A phase is about to start
    Phase,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Manual => "manual",
            Self::Phase => "phase",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes removed from the buffer, ready to issue.
#[derive(Debug)]
pub struct FlushBatch<K, V> {
    pub items: Vec<(K, V)>,
    pub reason: FlushReason,
}

#[derive(Debug)]
struct Pending<V> {
    value: V,
    queued_at: Instant,
}

pub struct Coalescer<K, V> {
    pending: DashMap<K, Pending<V>>,
    window: Duration,
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(window: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            window,
        }
    }

    /// Queue `value` under `key`. Returns true if it replaced a pending value.
    pub fn push(&self, key: K, value: V) -> bool {
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                slot.get_mut().value = value;
                true
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Pending {
                    value,
                    queued_at: Instant::now(),
                });
                false
            }
        }
    }

    /// Drop the pending write for `key`, if any.
    pub fn discard(&self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Remove every write older than the flush window.
    pub fn take_ready(&self) -> Option<FlushBatch<K, V>> {
        let window = self.window;
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|e| e.value().queued_at.elapsed() >= window)
            .map(|e| e.key().clone())
            .collect();

        // Re-check age on removal: the key may have been flushed and
        // re-queued since the scan.
        let items: Vec<(K, V)> = due
            .into_iter()
            .filter_map(|key| {
                self.pending
                    .remove_if(&key, |_, p| p.queued_at.elapsed() >= window)
                    .map(|(k, p)| (k, p.value))
            })
            .collect();

        if items.is_empty() {
            return None;
        }
        debug!(count = items.len(), "Buffered writes due for flush");
        Some(FlushBatch {
            items,
            reason: FlushReason::Time,
        })
    }

    /// Remove every pending write regardless of age.
    pub fn force_flush_with_reason(&self, reason: FlushReason) -> Option<FlushBatch<K, V>> {
        let keys: Vec<K> = self.pending.iter().map(|e| e.key().clone()).collect();
        let items: Vec<(K, V)> = keys
            .into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|(k, p)| (k, p.value)))
            .collect();

        if items.is_empty() {
            None
        } else {
            Some(FlushBatch { items, reason })
        }
    }
}
