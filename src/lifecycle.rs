//! Container lifecycle: creation, deletion, expiry and crash recovery.
//!
//! The manager is the only component that touches both the record store and
//! the runtime. Creation reserves ports before any runtime call and commits
//! the record only once the container is running. Deletion is claimed with a
//! `Running | Expiring -> Deleting` compare-and-set, so a manual delete and an
//! expiry firing for the same id execute at most one teardown between them.

use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::record::{ContainerRecord, ContainerState};
use crate::runtime::{BoundedRuntime, ContainerRuntime, ContainerStatus, ContainerTemplate};
use crate::scheduler::ExpiryScheduler;
use crate::store::RecordStore;
use chrono::{SubsecRound, Utc};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Upper bound on a single expiry backoff step.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Compare-and-set rounds before a deleter gives up to a concurrent caller.
const MAX_CLAIM_ROUNDS: usize = 4;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub default_port_count: usize,
    pub runtime_timeout: Duration,
    pub expiry_retries: u32,
    pub expiry_backoff: Duration,
    pub sweep_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(14_400),
            max_ttl: Duration::from_secs(7 * 24 * 3600),
            default_port_count: 2,
            runtime_timeout: Duration::from_secs(30),
            expiry_retries: 5,
            expiry_backoff: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    Manual,
    Expired,
    Recovered,
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeleteReason::Manual => "manual",
            DeleteReason::Expired => "expired",
            DeleteReason::Recovered => "recovered",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// This caller ran the teardown.
    Deleted,
    /// Another caller owns (or finished) the teardown.
    NoOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub rescheduled: usize,
    pub expired: usize,
    pub vanished: usize,
    pub orphans_removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub retried: usize,
    pub reclaimed: usize,
    pub stuck: usize,
}

pub struct LifecycleManager {
    store: Arc<dyn RecordStore>,
    runtime: BoundedRuntime,
    allocator: Arc<PortAllocator>,
    scheduler: Arc<ExpiryScheduler>,
    template: ContainerTemplate,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        runtime: Arc<dyn ContainerRuntime>,
        allocator: Arc<PortAllocator>,
        template: ContainerTemplate,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtime: BoundedRuntime::new(runtime, config.runtime_timeout),
            allocator,
            scheduler: ExpiryScheduler::new(),
            template,
            config,
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    fn validate(&self, ttl: Duration, port_count: usize) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::Validation("ttlSeconds must be positive".into()));
        }
        if ttl > self.config.max_ttl {
            return Err(Error::Validation(format!(
                "ttlSeconds must not exceed {}",
                self.config.max_ttl.as_secs()
            )));
        }
        if port_count == 0 || port_count > self.template.max_ports() {
            return Err(Error::Validation(format!(
                "portCount must be between 1 and {}",
                self.template.max_ports()
            )));
        }
        Ok(())
    }

    /// Provision a container that expires `ttl` after it has started.
    ///
    /// Runs on its own task: dropping the returned future does not interrupt
    /// provisioning or its compensation.
    pub async fn create_container(
        self: &Arc<Self>,
        ttl: Duration,
        port_count: usize,
    ) -> Result<ContainerRecord> {
        let manager = Arc::clone(self);
        run_to_completion(async move { manager.provision(ttl, port_count).await }).await
    }

    async fn provision(self: &Arc<Self>, ttl: Duration, port_count: usize) -> Result<ContainerRecord> {
        self.validate(ttl, port_count)?;
        let ttl_span = chrono::Duration::from_std(ttl)
            .map_err(|_| Error::Validation("ttlSeconds out of range".into()))?;

        let reservation = self.allocator.allocate(port_count)?;
        let spec = self.template.spec_for(reservation.ports())?;

        let id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                // A timed-out create may still have gone through; names are unique.
                if matches!(e, Error::RuntimeTimeout { .. }) {
                    self.discard(&spec.name).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.runtime.start(&id).await {
            warn!(id = %id, error = %e, "Start failed, removing created container");
            self.discard(&id).await;
            return Err(e);
        }

        let record = ContainerRecord::running(
            id.clone(),
            Utc::now().trunc_subsecs(3),
            ttl_span,
            reservation.ports().to_vec(),
        );
        if let Err(e) = self.store.insert(&record) {
            error!(id = %id, error = %e, "Failed to persist record, tearing container down");
            if let Err(stop_err) = self.runtime.stop(&id).await {
                warn!(id = %id, error = %stop_err, "Stop during rollback failed");
            }
            self.discard(&id).await;
            return Err(e);
        }

        reservation.into_lease();
        self.schedule_expiry(&record);
        info!(
            id = %record.id,
            ports = ?record.ports,
            expires_at = %record.expires_at,
            "Container provisioned"
        );
        Ok(record)
    }

    /// Best-effort removal of a container that never got a record.
    async fn discard(&self, id: &str) {
        if let Err(e) = self.runtime.remove(id).await {
            error!(id = %id, error = %e, "Compensating remove failed; container may be orphaned");
        }
    }

    /// Claim the teardown of `id` and run it.
    ///
    /// Returns `NotFound` if the store has never heard of `id`. Losing the
    /// claim to a concurrent caller is a successful [`DeleteOutcome::NoOp`].
    /// Like creation, the work runs on its own task and survives the caller
    /// going away.
    pub async fn delete_container(
        self: &Arc<Self>,
        id: &str,
        reason: DeleteReason,
    ) -> Result<DeleteOutcome> {
        let manager = Arc::clone(self);
        let id = id.to_string();
        run_to_completion(async move { manager.run_deletion(&id, reason).await }).await
    }

    async fn run_deletion(&self, id: &str, reason: DeleteReason) -> Result<DeleteOutcome> {
        let Some(record) = self.claim_deletion(id)? else {
            debug!(id = %id, reason = %reason, "Deletion already owned by another caller");
            return Ok(DeleteOutcome::NoOp);
        };

        info!(id = %id, reason = %reason, "Deleting container");
        let finished = match self.teardown(id).await {
            Ok(()) => self.store.delete(id).map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = finished {
            // Teardown is idempotent, so a later attempt may simply redo it.
            self.release_claim(id);
            return Err(e);
        }

        self.scheduler.cancel(id);
        self.allocator.release(&record.ports);
        info!(id = %id, reason = %reason, "Container deleted");
        Ok(DeleteOutcome::Deleted)
    }

    /// Hand a failed deletion back as reclaim-pending.
    fn release_claim(&self, id: &str) {
        if let Err(e) =
            self.store
                .compare_and_set_state(id, ContainerState::Deleting, ContainerState::Expiring)
        {
            error!(id = %id, error = %e, "Failed to release deletion lock");
        }
    }

    fn claim_deletion(&self, id: &str) -> Result<Option<ContainerRecord>> {
        for round in 0..MAX_CLAIM_ROUNDS {
            let Some(record) = self.store.get(id)? else {
                return if round == 0 {
                    Err(Error::NotFound(id.to_string()))
                } else {
                    Ok(None)
                };
            };
            if !record.state.is_deletable() {
                return Ok(None);
            }
            if self
                .store
                .compare_and_set_state(id, record.state, ContainerState::Deleting)?
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn teardown(&self, id: &str) -> Result<()> {
        // Remove is forced, so a failed stop does not block reclamation.
        if let Err(e) = self.runtime.stop(id).await {
            warn!(id = %id, error = %e, "Stop failed, forcing remove");
        }
        self.runtime.remove(id).await
    }

    /// Expiry path: mark the record expiring and retry teardown with backoff.
    ///
    /// After the last failed attempt the record stays `Expiring` and is
    /// reported as stuck.
    pub async fn expire(self: &Arc<Self>, id: &str) -> Result<DeleteOutcome> {
        let manager = Arc::clone(self);
        let id = id.to_string();
        let attempts = self.config.expiry_retries.max(1);
        run_to_completion(async move { manager.expire_with(&id, attempts).await }).await
    }

    async fn expire_with(&self, id: &str, attempts: u32) -> Result<DeleteOutcome> {
        if let Err(e) =
            self.store
                .compare_and_set_state(id, ContainerState::Running, ContainerState::Expiring)
        {
            warn!(id = %id, error = %e, "Could not mark container expiring");
        }

        let mut attempt = 1;
        loop {
            match self.run_deletion(id, DeleteReason::Expired).await {
                Ok(outcome) => return Ok(outcome),
                Err(Error::NotFound(_)) => return Ok(DeleteOutcome::NoOp),
                Err(e) if attempt >= attempts => {
                    error!(
                        id = %id,
                        attempts,
                        error = %e,
                        "Container stuck in expiring state, needs operator attention"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let backoff = self
                        .config
                        .expiry_backoff
                        .saturating_mul(1 << (attempt - 1).min(16))
                        .min(MAX_BACKOFF);
                    warn!(id = %id, attempt, error = %e, ?backoff, "Expiry teardown failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn schedule_expiry(self: &Arc<Self>, record: &ContainerRecord) {
        let delay = record.remaining(Utc::now());
        let manager = Arc::downgrade(self);
        let id = record.id.clone();
        self.scheduler.schedule(&record.id, delay, move || async move {
            if let Some(manager) = manager.upgrade() {
                let _ = manager.expire(&id).await;
            }
        });
        debug!(id = %record.id, ?delay, "Scheduled expiry");
    }

    pub fn list_active(&self) -> Result<Vec<ContainerRecord>> {
        self.store.list_active()
    }

    pub fn get(&self, id: &str) -> Result<ContainerRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn pending_expiries(&self) -> Vec<String> {
        self.scheduler.pending()
    }

    pub fn scheduled_deadline(&self, id: &str) -> Option<tokio::time::Instant> {
        self.scheduler.deadline(id)
    }

    /// Align persisted records with the runtime after a restart.
    ///
    /// Overdue records are torn down now, live ones get their timers and port
    /// leases back, records whose container disappeared are dropped, and
    /// labelled containers without a record are removed.
    pub async fn reconcile(self: &Arc<Self>) -> Result<ReconcileReport> {
        let records = self.store.list_active()?;
        let known: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let now = Utc::now();
        let mut report = ReconcileReport::default();
        let mut overdue = Vec::new();

        for record in records {
            match record.state {
                ContainerState::Deleting => {
                    // Crashed mid-teardown; reopen the claim.
                    self.store.compare_and_set_state(
                        &record.id,
                        ContainerState::Deleting,
                        ContainerState::Expiring,
                    )?;
                    overdue.push(record);
                }
                ContainerState::Expiring => overdue.push(record),
                _ if record.is_expired_at(now) => overdue.push(record),
                _ => match self.runtime.inspect(&record.id).await {
                    Ok(ContainerStatus::Missing) => {
                        warn!(id = %record.id, "Container vanished from runtime, dropping record");
                        self.store.delete(&record.id)?;
                        report.vanished += 1;
                    }
                    status => {
                        if let Err(e) = status {
                            warn!(id = %record.id, error = %e, "Inspect failed, keeping record");
                        }
                        self.allocator.claim(&record.ports);
                        self.schedule_expiry(&record);
                        report.rescheduled += 1;
                    }
                },
            }
        }

        for record in &overdue {
            self.allocator.claim(&record.ports);
        }
        let results = join_all(overdue.iter().map(|r| self.expire_with(&r.id, 1))).await;
        for (record, result) in overdue.iter().zip(results) {
            match result {
                Ok(_) => report.expired += 1,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "Overdue container left for sweeper");
                    report.failed += 1;
                }
            }
        }

        match self.runtime.list_managed().await {
            Ok(ids) => {
                for id in ids.into_iter().filter(|id| !known.contains(id)) {
                    warn!(id = %id, "Removing orphaned container with no record");
                    match self.teardown(&id).await {
                        Ok(()) => report.orphans_removed += 1,
                        Err(e) => warn!(id = %id, error = %e, "Orphan removal failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list runtime containers for orphan check"),
        }

        info!(
            rescheduled = report.rescheduled,
            expired = report.expired,
            vanished = report.vanished,
            orphans = report.orphans_removed,
            failed = report.failed,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Re-drive records that are reclaim-pending or past expiry.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let due: Vec<ContainerRecord> = self
            .store
            .list_active()?
            .into_iter()
            .filter(|r| {
                r.state == ContainerState::Expiring
                    || (r.state == ContainerState::Running
                        && r.is_expired_at(now)
                        && !self.scheduler.is_scheduled(&r.id))
            })
            .collect();

        let mut report = SweepReport::default();
        for record in due {
            report.retried += 1;
            match self.expire_with(&record.id, 1).await {
                Ok(_) => report.reclaimed += 1,
                Err(e) => {
                    error!(id = %record.id, error = %e, "Container still stuck after sweep");
                    report.stuck += 1;
                }
            }
        }
        if report.retried > 0 {
            info!(
                retried = report.retried,
                reclaimed = report.reclaimed,
                stuck = report.stuck,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    /// Periodic [`sweep`](Self::sweep) until the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.sweep().await {
                    warn!(error = %e, "Sweep failed");
                }
            }
        })
    }

    /// Drop all in-memory timers. Records stay durable for the next start.
    pub fn shutdown(&self) {
        let cancelled = self.scheduler.cancel_all();
        info!(cancelled, "Cancelled pending expiries");
    }
}

/// Drive `fut` on a spawned task and wait for it, so cancelling the waiter
/// leaves the operation running.
async fn run_to_completion<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(Error::Internal(format!("lifecycle task cancelled: {}", e))),
    }
}
