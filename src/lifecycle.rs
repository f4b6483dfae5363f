//! Caller-facing lifecycle operations.
//!
//! Snapshot, restore and teardown must not overlap on one sandbox, and the
//! substrate offers no lock, so every operation here holds a per-sandbox
//! async mutex for its duration. Teardowns snapshot first and abort if that
//! snapshot fails.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use dashmap::DashMap;
use data_model::{SnapshotReason, TenantScope};
use tokio::{
    sync::{watch, Mutex, OwnedMutexGuard},
    time::Instant,
};
use tracing::{debug, info};

use crate::{
    background::BackgroundTasks,
    cache::{Endpoint, EndpointCache},
    error::{Result, SandboxError},
    health::HealthGate,
    restore::{RestoreEngine, RestoreReport},
    sandbox::{Sandbox, SandboxProvider, ARCHIVE_EXEC_TIMEOUT},
    snapshots::{CreateOutcome, SnapshotStore},
    supervisor::{ProcessState, ProcessSupervisor, TenantSettings},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Key of the pre-teardown snapshot, `None` when there was nothing to
    /// snapshot.
    pub snapshot_key: Option<String>,
    pub stopped: Vec<u32>,
}

pub struct LifecycleManager {
    provider: Arc<dyn SandboxProvider>,
    health: HealthGate,
    store: Arc<SnapshotStore>,
    restore: Arc<RestoreEngine>,
    supervisor: Arc<ProcessSupervisor>,
    cache: Arc<EndpointCache>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LifecycleManager {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        health: HealthGate,
        store: Arc<SnapshotStore>,
        restore: Arc<RestoreEngine>,
        supervisor: Arc<ProcessSupervisor>,
        cache: Arc<EndpointCache>,
    ) -> Self {
        Self {
            provider,
            health,
            store,
            restore,
            supervisor,
            cache,
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, sandbox_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub async fn sandbox(&self, scope: &TenantScope) -> Result<Arc<dyn Sandbox>> {
        let sandbox_id = scope.sandbox_id();
        Ok(self
            .provider
            .sandbox(&sandbox_id)
            .await
            .with_context(|| format!("resolving sandbox {}", sandbox_id))?)
    }

    pub fn health(&self) -> &HealthGate {
        &self.health
    }

    pub async fn snapshot(
        &self,
        scope: &TenantScope,
        reason: SnapshotReason,
    ) -> Result<CreateOutcome> {
        let _guard = self.lock(&scope.sandbox_id()).await;
        let sandbox = self.sandbox(scope).await?;
        self.snapshot_locked(sandbox.as_ref(), scope, reason).await
    }

    /// Snapshot for the idle sweeper. A sandbox torn down since it went idle
    /// is left alone rather than brought back to be archived.
    pub async fn snapshot_if_present(
        &self,
        scope: &TenantScope,
        reason: SnapshotReason,
    ) -> Result<CreateOutcome> {
        let sandbox_id = scope.sandbox_id();
        let _guard = self.lock(&sandbox_id).await;
        let exists = self
            .provider
            .exists(&sandbox_id)
            .await
            .with_context(|| format!("looking up sandbox {}", sandbox_id))?;
        if !exists {
            debug!(sandbox_id = %sandbox_id, "sandbox is gone, skipping snapshot");
            self.release_lock(&sandbox_id);
            return Ok(CreateOutcome::NothingToSnapshot);
        }
        let sandbox = self.sandbox(scope).await?;
        self.snapshot_locked(sandbox.as_ref(), scope, reason).await
    }

    async fn snapshot_locked(
        &self,
        sandbox: &dyn Sandbox,
        scope: &TenantScope,
        reason: SnapshotReason,
    ) -> Result<CreateOutcome> {
        self.health.require_healthy(sandbox).await?;
        self.store.create(sandbox, scope, reason).await
    }

    pub async fn restore(
        &self,
        scope: &TenantScope,
        key: &str,
        mark_as_latest: bool,
    ) -> Result<RestoreReport> {
        let sandbox_id = scope.sandbox_id();
        let _guard = self.lock(&sandbox_id).await;
        let sandbox = self.sandbox(scope).await?;
        let result = self
            .restore
            .restore(sandbox.as_ref(), scope, key, mark_as_latest)
            .await;
        // the filesystem may have changed even if the restore failed
        self.cache.invalidate(&sandbox_id);
        result
    }

    /// Make sure the persistent process is up and remember its endpoint.
    pub async fn ensure_running(
        &self,
        scope: &TenantScope,
        settings: &TenantSettings,
    ) -> Result<(ProcessState, Endpoint)> {
        let sandbox_id = scope.sandbox_id();
        let _guard = self.lock(&sandbox_id).await;
        let sandbox = self.sandbox(scope).await?;
        self.health.require_healthy(sandbox.as_ref()).await?;
        let state = self
            .supervisor
            .ensure_running(sandbox.as_ref(), scope, settings)
            .await?;
        let config = self.supervisor.config();
        let endpoint = Endpoint {
            port: config.port,
            path: config.work_path.clone(),
            pid: state.pid(),
        };
        self.cache.insert(&sandbox_id, endpoint.clone());
        Ok((state, endpoint))
    }

    /// Snapshot, then stop the persistent process. The sandbox itself stays.
    pub async fn restart(&self, scope: &TenantScope) -> Result<TeardownReport> {
        let sandbox_id = scope.sandbox_id();
        let _guard = self.lock(&sandbox_id).await;
        let sandbox = self.sandbox(scope).await?;
        let snapshot = self
            .snapshot_locked(sandbox.as_ref(), scope, SnapshotReason::PreRestart)
            .await?;
        let stopped = self.supervisor.stop(sandbox.as_ref()).await?;
        self.cache.invalidate(&sandbox_id);
        info!(sandbox_id = %sandbox_id, ?stopped, "sandbox restarted");
        Ok(TeardownReport {
            snapshot_key: created_key(snapshot),
            stopped,
        })
    }

    /// Snapshot, then destroy the sandbox. The next request gets a fresh one
    /// which restores from the snapshot on start.
    pub async fn reset(&self, scope: &TenantScope) -> Result<TeardownReport> {
        let sandbox_id = scope.sandbox_id();
        let _guard = self.lock(&sandbox_id).await;
        let sandbox = self.sandbox(scope).await?;
        let snapshot = self
            .snapshot_locked(sandbox.as_ref(), scope, SnapshotReason::PreReset)
            .await?;
        let stopped = self.supervisor.stop(sandbox.as_ref()).await?;
        self.destroy(&sandbox_id).await?;
        info!(sandbox_id = %sandbox_id, "sandbox reset");
        Ok(TeardownReport {
            snapshot_key: created_key(snapshot),
            stopped,
        })
    }

    /// Snapshot, wipe the watched directories, then destroy the sandbox.
    /// Stored snapshots are kept.
    pub async fn factory_reset(&self, scope: &TenantScope) -> Result<TeardownReport> {
        let sandbox_id = scope.sandbox_id();
        let _guard = self.lock(&sandbox_id).await;
        let sandbox = self.sandbox(scope).await?;
        let snapshot = self
            .snapshot_locked(sandbox.as_ref(), scope, SnapshotReason::PreFactoryReset)
            .await?;
        let stopped = self.supervisor.stop(sandbox.as_ref()).await?;

        let packager = self.store.packager();
        let command = packager.clear_command(sandbox.root(), packager.directories());
        let output = sandbox
            .exec(&command, ARCHIVE_EXEC_TIMEOUT)
            .await
            .context("clearing watched directories")?;
        if !output.success() {
            return Err(SandboxError::ArchiveFailure {
                step: "clear directories",
                diagnostic: output.diagnostic(),
            });
        }
        self.destroy(&sandbox_id).await?;
        info!(sandbox_id = %sandbox_id, "sandbox factory reset");
        Ok(TeardownReport {
            snapshot_key: created_key(snapshot),
            stopped,
        })
    }

    /// Called with the sandbox lock held.
    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        self.cache.invalidate(sandbox_id);
        self.provider
            .destroy(sandbox_id)
            .await
            .with_context(|| format!("destroying sandbox {}", sandbox_id))?;
        self.release_lock(sandbox_id);
        Ok(())
    }

    /// Drop the lock entry of a sandbox that no longer exists. Called with
    /// the lock held; only the map and the caller's guard hold it when
    /// nobody is waiting.
    fn release_lock(&self, sandbox_id: &str) {
        self.locks
            .remove_if(sandbox_id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

fn created_key(outcome: CreateOutcome) -> Option<String> {
    match outcome {
        CreateOutcome::Created(created) => Some(created.key),
        CreateOutcome::NothingToSnapshot => None,
    }
}

#[derive(Debug, Clone)]
struct Activity {
    scope: TenantScope,
    last_active: Instant,
    snapshotted: bool,
}

/// Tracks the last activity per sandbox and snapshots sandboxes that have
/// gone idle, once per idle period.
#[derive(Debug)]
pub struct IdleMonitor {
    idle_after: Duration,
    activity: DashMap<String, Activity>,
}

impl IdleMonitor {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            idle_after,
            activity: DashMap::new(),
        }
    }

    pub fn touch(&self, scope: &TenantScope) {
        self.activity.insert(
            scope.sandbox_id(),
            Activity {
                scope: scope.clone(),
                last_active: Instant::now(),
                snapshotted: false,
            },
        );
    }

    pub fn forget(&self, sandbox_id: &str) {
        self.activity.remove(sandbox_id);
    }

    pub fn is_tracked(&self, sandbox_id: &str) -> bool {
        self.activity.contains_key(sandbox_id)
    }

    /// Scopes idle past the threshold that have not been snapshotted since
    /// their last activity. Marks them as snapshotted.
    pub fn take_due(&self) -> Vec<TenantScope> {
        let now = Instant::now();
        let mut due = Vec::new();
        for mut entry in self.activity.iter_mut() {
            let activity = entry.value_mut();
            if !activity.snapshotted && now.duration_since(activity.last_active) >= self.idle_after
            {
                activity.snapshotted = true;
                due.push(activity.scope.clone());
            }
        }
        due
    }

    pub async fn run(
        self: Arc<Self>,
        lifecycle: Arc<LifecycleManager>,
        background: BackgroundTasks,
        sweep_interval: Duration,
        mut shutdown_rx: watch::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("idle monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    for scope in self.take_due() {
                        debug!(tenant = %scope, "snapshotting idle sandbox");
                        let monitor = self.clone();
                        let lifecycle = lifecycle.clone();
                        background.spawn("idle-snapshot", async move {
                            if !monitor.is_tracked(&scope.sandbox_id()) {
                                return Ok(());
                            }
                            lifecycle
                                .snapshot_if_present(&scope, SnapshotReason::Idle)
                                .await?;
                            Ok::<(), anyhow::Error>(())
                        });
                    }
                }
            }
        }
    }
}
