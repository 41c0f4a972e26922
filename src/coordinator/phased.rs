// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Phase coordinator: keeps multi-step operations from interleaving with
//! single-record writes on the same data kind.
//!
//! Every data kind has a [`PhaseGate`]. Writes pass a gate freely while it
//! has no phase and no queue. A phase needs the gate to itself, so it waits
//! for in-flight writes to finish. Anything that cannot proceed joins the
//! gate's FIFO queue (or is rejected with [`StorageError::PhaseBusy`] under
//! [`PhasePolicy::Reject`]). Queued entries are admitted strictly one at a
//! time in arrival order, so a queued write never overtakes an earlier one.
//!
//! Multi-kind phases take their gates in [`DataKind`] order (user before
//! group), which keeps two overlapping phases from deadlocking.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bulk::BulkUpdate;
use crate::config::{PhasePolicy, StorageConfig};
use crate::events::{CreationCause, DeletionCause};
use crate::model::{ActionLog, DataKind, Group, HeldPermission, LogEntry, Track, User};
use crate::storage::traits::{Meta, StorageError};

use super::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Write,
    Phase,
}

struct Waiter {
    holder: Holder,
    tx: oneshot::Sender<GateTicket>,
}

#[derive(Default)]
struct GateState {
    phase_active: bool,
    in_flight: usize,
    queue: VecDeque<Waiter>,
}

impl GateState {
    fn is_idle(&self) -> bool {
        !self.phase_active && self.in_flight == 0 && self.queue.is_empty()
    }

    fn grant(&mut self, holder: Holder) {
        match holder {
            Holder::Write => self.in_flight += 1,
            Holder::Phase => self.phase_active = true,
        }
    }

    fn revoke(&mut self, holder: Holder) {
        match holder {
            Holder::Write => self.in_flight = self.in_flight.saturating_sub(1),
            Holder::Phase => self.phase_active = false,
        }
    }
}

/// FIFO gate for one data kind.
pub(crate) struct PhaseGate {
    kind: DataKind,
    state: Mutex<GateState>,
    idle: Notify,
}

impl PhaseGate {
    fn new(kind: DataKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(GateState::default()),
            idle: Notify::new(),
        })
    }

    async fn enter(self: &Arc<Self>, holder: Holder, policy: PhasePolicy) -> Result<GateTicket, StorageError> {
        let rx = {
            let mut state = self.state.lock();
            let free = match holder {
                Holder::Write => !state.phase_active && state.queue.is_empty(),
                Holder::Phase => state.is_idle(),
            };
            if free {
                state.grant(holder);
                return Ok(GateTicket::new(self.clone(), holder));
            }

            let conflict = match holder {
                Holder::Write => true,
                Holder::Phase => {
                    state.phase_active || state.queue.iter().any(|w| w.holder == Holder::Phase)
                }
            };
            if conflict && policy == PhasePolicy::Reject {
                crate::metrics::record_phase_rejection(self.kind);
                crate::metrics::record_operation("phase", "enter", "rejected");
                return Err(StorageError::PhaseBusy(self.kind));
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { holder, tx });
            rx
        };

        let waited = Instant::now();
        let ticket = rx.await.map_err(|_| StorageError::ShutDown)?;
        crate::metrics::record_phase_wait(self.kind, waited.elapsed());
        Ok(ticket)
    }

    fn release(self: &Arc<Self>, holder: Holder) {
        let mut state = self.state.lock();
        state.revoke(holder);
        self.pump(&mut state);
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Admit the head of the queue if the gate is free. Called with the
    /// state lock held.
    fn pump(self: &Arc<Self>, state: &mut GateState) {
        while !state.phase_active && state.in_flight == 0 {
            let Some(waiter) = state.queue.pop_front() else {
                return;
            };
            state.grant(waiter.holder);
            let ticket = GateTicket::new(self.clone(), waiter.holder);
            match waiter.tx.send(ticket) {
                Ok(()) => return,
                Err(mut ticket) => {
                    // Waiter gave up; dropping the ticket normally would
                    // re-enter this lock.
                    ticket.defuse();
                    state.revoke(waiter.holder);
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    /// Drop every queued waiter. Their `enter` calls resolve to
    /// [`StorageError::ShutDown`].
    fn abandon_queue(&self) -> usize {
        let mut state = self.state.lock();
        let abandoned = state.queue.len();
        state.queue.clear();
        abandoned
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Admission through a gate. Dropping it releases the gate.
struct GateTicket {
    gate: Arc<PhaseGate>,
    holder: Holder,
    armed: bool,
}

impl GateTicket {
    fn new(gate: Arc<PhaseGate>, holder: Holder) -> Self {
        Self { gate, holder, armed: true }
    }

    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        if self.armed {
            self.gate.release(self.holder);
        }
    }
}

/// An active phase. The gates it holds open again when it is dropped.
pub struct PhaseGuard {
    tickets: Vec<GateTicket>,
    started: Instant,
}

impl PhaseGuard {
    /// Kinds held by this phase.
    #[must_use]
    pub fn kinds(&self) -> Vec<DataKind> {
        self.tickets.iter().map(|t| t.gate.kind).collect()
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        crate::metrics::record_phase_duration(self.started.elapsed());
        // Release in reverse acquisition order.
        while let Some(ticket) = self.tickets.pop() {
            drop(ticket);
        }
    }
}

pub struct PhasedStorage {
    inner: Arc<dyn Storage>,
    gates: Arc<BTreeMap<DataKind, Arc<PhaseGate>>>,
    policy: PhasePolicy,
    shutdown_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl PhasedStorage {
    pub fn new(inner: Arc<dyn Storage>, config: &StorageConfig) -> Self {
        let gates = DataKind::ALL
            .iter()
            .map(|kind| (*kind, PhaseGate::new(*kind)))
            .collect();
        Self {
            inner,
            gates: Arc::new(gates),
            policy: config.phase_policy,
            shutdown_timeout: config.shutdown_timeout(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn gate(&self, kind: DataKind) -> Result<&Arc<PhaseGate>, StorageError> {
        self.gates
            .get(&kind)
            .ok_or_else(|| StorageError::Config(format!("no phase gate for the {} kind", kind)))
    }

    /// Start a phase over `kinds`, waiting for (or, under the reject policy,
    /// refusing) conflicting work. Buffered writes are flushed before the
    /// guard is returned.
    pub async fn begin_phase(&self, kinds: &[DataKind]) -> Result<PhaseGuard, StorageError> {
        self.ensure_open()?;
        let mut ordered: Vec<DataKind> = kinds.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guard = PhaseGuard {
            tickets: Vec::with_capacity(ordered.len()),
            started: Instant::now(),
        };
        for kind in ordered {
            // On error the partially built guard drops and frees what it took.
            let ticket = self.gate(kind)?.enter(Holder::Phase, self.policy).await?;
            guard.tickets.push(ticket);
        }
        guard.started = Instant::now();
        debug!(kinds = ?guard.kinds(), "Phase started");

        self.inner.force_flush().await;
        Ok(guard)
    }

    /// Run `work` as a phase over `kinds`. `work` receives the unbuffered,
    /// ungated stack beneath this coordinator.
    pub async fn run_phase<T, F, Fut>(&self, kinds: &[DataKind], work: F) -> Result<T, StorageError>
    where
        F: FnOnce(Arc<dyn Storage>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let _phase = self.begin_phase(kinds).await?;
        work(self.inner.clone().no_buffer()).await
    }

    /// Whether a phase currently holds `kind`.
    #[must_use]
    pub fn in_phase(&self, kind: DataKind) -> bool {
        self.gates
            .get(&kind)
            .map(|g| g.state.lock().phase_active)
            .unwrap_or(false)
    }

    async fn gated<T, Fut>(&self, kind: DataKind, op: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.ensure_open()?;
        let _ticket = self.gate(kind)?.enter(Holder::Write, self.policy).await?;
        op.await
    }

    async fn open<T, Fut>(&self, op: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.ensure_open()?;
        op.await
    }
}

#[async_trait]
impl Storage for PhasedStorage {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn meta(&self) -> Meta {
        self.inner.meta()
    }

    async fn init(&self) -> Result<(), StorageError> {
        self.open(self.inner.init()).await
    }

    #[tracing::instrument(skip(self))]
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Storage already shut down");
            return;
        }

        let drained = tokio::time::timeout(
            self.shutdown_timeout,
            join_all(self.gates.values().map(|g| g.wait_idle())),
        )
        .await;
        if drained.is_err() {
            let busy: Vec<DataKind> = self
                .gates
                .values()
                .filter(|g| !g.is_idle())
                .map(|g| g.kind)
                .collect();
            warn!(?busy, timeout = ?self.shutdown_timeout, "Shutting down with phases or writes still active");

            let abandoned: usize = self.gates.values().map(|g| g.abandon_queue()).sum();
            if abandoned > 0 {
                warn!(abandoned, "Rejecting work still queued behind active phases");
            }
        }

        self.inner.shutdown().await;
        info!("Storage shut down");
    }

    fn no_buffer(self: Arc<Self>) -> Arc<dyn Storage> {
        Arc::new(PhasedStorage {
            inner: self.inner.clone().no_buffer(),
            gates: self.gates.clone(),
            policy: self.policy,
            shutdown_timeout: self.shutdown_timeout,
            closed: self.closed.clone(),
        })
    }

    async fn force_flush(&self) {
        self.inner.force_flush().await;
    }

    async fn log_action(&self, entry: LogEntry) -> Result<(), StorageError> {
        self.gated(DataKind::Log, self.inner.log_action(entry)).await
    }

    async fn get_log(&self) -> Result<ActionLog, StorageError> {
        self.open(self.inner.get_log()).await
    }

    async fn apply_bulk_update(&self, update: BulkUpdate) -> Result<(), StorageError> {
        let _phase = self.begin_phase(update.target.kinds()).await?;
        let result = self.inner.apply_bulk_update(update).await;
        let status = if result.is_ok() { "success" } else { "error" };
        crate::metrics::record_operation("phase", "apply_bulk_update", status);
        result
    }

    async fn load_user(&self, uuid: Uuid, username: Option<String>) -> Result<User, StorageError> {
        self.open(self.inner.load_user(uuid, username)).await
    }

    async fn save_user(&self, user: User) -> Result<(), StorageError> {
        self.gated(DataKind::User, self.inner.save_user(user)).await
    }

    async fn get_unique_users(&self) -> Result<HashSet<Uuid>, StorageError> {
        self.open(self.inner.get_unique_users()).await
    }

    async fn get_users_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<Uuid>>, StorageError> {
        self.open(self.inner.get_users_with_permission(permission)).await
    }

    async fn create_and_load_group(&self, name: String, cause: CreationCause) -> Result<Group, StorageError> {
        self.gated(DataKind::Group, self.inner.create_and_load_group(name, cause)).await
    }

    async fn load_group(&self, name: String) -> Result<Option<Group>, StorageError> {
        self.open(self.inner.load_group(name)).await
    }

    async fn load_all_groups(&self) -> Result<Vec<Group>, StorageError> {
        self.open(self.inner.load_all_groups()).await
    }

    async fn save_group(&self, group: Group) -> Result<(), StorageError> {
        self.gated(DataKind::Group, self.inner.save_group(group)).await
    }

    async fn delete_group(&self, group: Group, cause: DeletionCause) -> Result<(), StorageError> {
        self.gated(DataKind::Group, self.inner.delete_group(group, cause)).await
    }

    async fn get_groups_with_permission(&self, permission: String) -> Result<Vec<HeldPermission<String>>, StorageError> {
        self.open(self.inner.get_groups_with_permission(permission)).await
    }

    async fn create_and_load_track(&self, name: String, cause: CreationCause) -> Result<Track, StorageError> {
        self.gated(DataKind::Track, self.inner.create_and_load_track(name, cause)).await
    }

    async fn load_track(&self, name: String) -> Result<Option<Track>, StorageError> {
        self.open(self.inner.load_track(name)).await
    }

    async fn load_all_tracks(&self) -> Result<Vec<Track>, StorageError> {
        self.open(self.inner.load_all_tracks()).await
    }

    async fn save_track(&self, track: Track) -> Result<(), StorageError> {
        self.gated(DataKind::Track, self.inner.save_track(track)).await
    }

    async fn delete_track(&self, track: Track, cause: DeletionCause) -> Result<(), StorageError> {
        self.gated(DataKind::Track, self.inner.delete_track(track, cause)).await
    }

    async fn save_uuid_data(&self, uuid: Uuid, username: String) -> Result<(), StorageError> {
        self.gated(DataKind::Uuid, self.inner.save_uuid_data(uuid, username)).await
    }

    async fn get_uuid(&self, username: String) -> Result<Option<Uuid>, StorageError> {
        self.open(self.inner.get_uuid(username)).await
    }

    async fn get_name(&self, uuid: Uuid) -> Result<Option<String>, StorageError> {
        self.open(self.inner.get_name(uuid)).await
    }
}
