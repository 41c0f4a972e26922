// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the storage stack.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `perms_storage_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `layer`: facade, buffer, phase
//! - `operation`: load_user, save_group, apply_bulk_update, ...
//! - `status`: success, error, rejected, queued

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::model::DataKind;

/// Record an operation outcome
pub fn record_operation(layer: &str, operation: &str, status: &str) {
    counter!(
        "perms_storage_operations_total",
        "layer" => layer.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record driver call latency (time on the worker, excluding queueing)
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "perms_storage_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record time spent waiting for a worker permit
pub fn record_queue_wait(duration: Duration) {
    histogram!("perms_storage_worker_wait_seconds").record(duration.as_secs_f64());
}

/// Record an event emitted to the dispatcher
pub fn record_event(kind: &str) {
    counter!(
        "perms_storage_events_total",
        "event" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE BUFFER
// ═══════════════════════════════════════════════════════════════════════════

/// A buffered write replaced an older pending write for the same key
pub fn record_coalesced(kind: DataKind) {
    counter!(
        "perms_storage_buffer_coalesced_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record how many writes a flush issued
pub fn record_flush(reason: &str, count: usize) {
    histogram!(
        "perms_storage_flush_size",
        "reason" => reason.to_string()
    )
    .record(count as f64);
}

/// A flushed write failed and was dropped
pub fn record_flush_failure(kind: DataKind) {
    counter!(
        "perms_storage_flush_failures_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Set number of writes waiting in the buffer
pub fn set_buffer_pending(count: usize) {
    gauge!("perms_storage_buffer_pending").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// PHASES
// ═══════════════════════════════════════════════════════════════════════════

/// A write or phase had to wait for the gate
pub fn record_phase_wait(kind: DataKind, duration: Duration) {
    histogram!(
        "perms_storage_phase_wait_seconds",
        "kind" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

/// A write or phase was rejected because a phase was active
pub fn record_phase_rejection(kind: DataKind) {
    counter!(
        "perms_storage_phase_rejections_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record how long a phase held its gates
pub fn record_phase_duration(duration: Duration) {
    histogram!("perms_storage_phase_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// A backend failed during init or shutdown
pub fn record_backend_failure(backend: &str, stage: &str) {
    counter!(
        "perms_storage_backend_failures_total",
        "backend" => backend.to_string(),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Set backend health status (1 = running, 0 = stopped/failed)
pub fn set_backend_running(backend: &str, running: bool) {
    gauge!(
        "perms_storage_backend_running",
        "backend" => backend.to_string()
    )
    .set(if running { 1.0 } else { 0.0 });
}
