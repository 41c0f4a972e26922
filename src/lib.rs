//! # Perms Storage
//!
//! Asynchronous persistence core for a permissions system: users, groups,
//! promotion tracks, UUID↔name records and the action log.
//!
//! ## Architecture
//!
//! A blocking backend driver is wrapped in three async layers that all
//! implement the same [`Storage`] contract:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PhasedStorage (phase gates)                │
//! │  • One FIFO gate per data kind                             │
//! │  • Bulk updates hold their kinds' gates exclusively        │
//! │  • Queue or reject conflicting writes                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                BufferedStorage (write buffer)               │
//! │  • Last-write-wins coalescing per entity key               │
//! │  • Background flush task, failures logged and dropped      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (flushed writes, reads)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   AsyncStorage (facade)                     │
//! │  • Driver calls on the blocking pool                       │
//! │  • Lifecycle events for live entities                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Driver (optionally a SplitDriver)              │
//! │  • Per-kind routing to named backends                      │
//! │  • Aggregate init, best-effort shutdown                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use perms_storage::{CreationCause, MemoryDriver, Storage, StorageBuilder, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = StorageBuilder::new(StorageConfig::default())
//!         .backend("memory", Arc::new(MemoryDriver::new()))
//!         .build()
//!         .expect("Invalid storage setup");
//!
//!     storage.init().await.expect("Failed to init");
//!
//!     let mut admin = storage
//!         .create_and_load_group("admin".into(), CreationCause::Command)
//!         .await
//!         .expect("Failed to create group");
//!     admin.nodes.push(perms_storage::Node::new("*"));
//!     storage.save_group(admin).await.expect("Failed to queue save");
//!
//!     storage.shutdown().await;
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`StorageConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`Storage`] contract and its three layers
//! - [`storage`]: The blocking [`Driver`] contract, memory driver and split router
//! - [`batching`]: Last-write-wins coalescer behind the write buffer
//! - [`bulk`]: Declarative bulk updates
//! - [`events`]: Lifecycle events and dispatchers
//! - [`entities`]: Live entity lookup
//! - [`model`]: Entity records

pub mod config;
pub mod model;
pub mod bulk;
pub mod storage;
pub mod events;
pub mod entities;
pub mod batching;
pub mod coordinator;
pub mod metrics;

pub use config::{PhasePolicy, SplitConfig, StorageConfig};
pub use model::{ActedType, ActionLog, DataKind, Group, HeldPermission, LogEntry, Node, Track, User};
pub use bulk::{BulkAction, BulkTarget, BulkUpdate, Comparison, Constraint, NodeField};
pub use storage::traits::{Driver, Meta, StorageError};
pub use storage::memory::MemoryDriver;
pub use storage::split::SplitDriver;
pub use events::{BroadcastDispatcher, CreationCause, DeletionCause, EventDispatcher, NoopDispatcher, StorageEvent};
pub use entities::{EntityLookup, LoadedEntities};
pub use batching::coalescer::{Coalescer, FlushBatch, FlushReason};
pub use coordinator::{
    AsyncStorage, BufferKey, BufferedStorage, PendingWrite, PhaseGuard, PhasedStorage, Storage, StorageBuilder,
};
