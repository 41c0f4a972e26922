//! Configuration for the storage stack.
//!
//! # Example
//!
//! ```
//! use perms_storage::{StorageConfig, PhasePolicy};
//!
//! // Minimal config (uses defaults)
//! let config = StorageConfig::default();
//! assert_eq!(config.buffer_flush_ms, 250);
//! assert_eq!(config.phase_policy, PhasePolicy::Queue);
//!
//! // Full config
//! let config = StorageConfig {
//!     buffer_flush_ms: 500,
//!     worker_concurrency: 4,
//!     phase_policy: PhasePolicy::Reject,
//!     ..Default::default()
//! };
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::model::DataKind;
use crate::storage::traits::StorageError;

/// Prefix for environment overrides, e.g. `PERMS_STORAGE_BUFFER_FLUSH_MS=100`.
pub const ENV_PREFIX: &str = "PERMS_STORAGE_";

/// What a write does when it meets an active phase on its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhasePolicy {
    /// Wait until the phase completes, then run in arrival order
    Queue,
    /// Fail immediately with `StorageError::PhaseBusy`
    Reject,
}

impl Default for PhasePolicy {
    fn default() -> Self {
        Self::Queue
    }
}

/// Configuration for the storage stack.
///
/// All fields have defaults matching the reference deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// How long a buffered write may wait before it is flushed (default: 250 ms)
    #[serde(default = "default_buffer_flush_ms")]
    pub buffer_flush_ms: u64,

    /// Period of the background flush task (default: 100 ms)
    #[serde(default = "default_flush_tick_ms")]
    pub flush_tick_ms: u64,

    /// Max driver calls running at once on the blocking pool
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default)]
    pub phase_policy: PhasePolicy,

    /// How long shutdown waits for in-flight writes and phases
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Split routing, if more than one backend is used
    #[serde(default)]
    pub split: Option<SplitConfig>,
}

fn default_buffer_flush_ms() -> u64 { 250 }
fn default_flush_tick_ms() -> u64 { 100 }
fn default_worker_concurrency() -> usize { 16 }
fn default_shutdown_timeout_ms() -> u64 { 10_000 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_flush_ms: default_buffer_flush_ms(),
            flush_tick_ms: default_flush_tick_ms(),
            worker_concurrency: default_worker_concurrency(),
            phase_policy: PhasePolicy::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            split: None,
        }
    }
}

impl StorageConfig {
    /// Load from a TOML file, then apply `PERMS_STORAGE_*` env overrides.
    /// A missing file yields defaults plus env.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Parse a TOML document (no env layering).
    pub fn from_toml_str(toml: &str) -> Result<Self, StorageError> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| StorageError::Config(e.to_string()))
    }

    #[must_use]
    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_ms)
    }

    #[must_use]
    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms.max(1))
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// `[split]` section: data kind name → backend name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SplitConfig {
    #[serde(default)]
    pub types: HashMap<String, String>,
}

impl SplitConfig {
    /// Parsed kind map. Backend names are lower-cased.
    pub fn kind_map(&self) -> Result<HashMap<DataKind, String>, StorageError> {
        self.types
            .iter()
            .map(|(kind, backend)| Ok((kind.parse::<DataKind>()?, backend.trim().to_lowercase())))
            .collect()
    }
}
