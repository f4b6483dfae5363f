//! Rebuilds a sandbox's filesystem from a stored snapshot.
//!
//! Steps run strictly in order: validating, fetching, health-checking,
//! writing, extracting and optionally publishing-latest. A failure at any
//! step is wrapped in [`SandboxError::Restore`] carrying that step.
//!
//! Extraction clears the target directories first. If it fails partway the
//! directories may be left partially cleared; callers surface that and
//! offer a restart rather than retrying here.

use std::sync::Arc;

use data_model::TenantScope;
use tracing::{info, warn};

use crate::{
    error::{Result, SandboxError},
    health::HealthGate,
    sandbox::{shell_quote, Sandbox, ARCHIVE_EXEC_TIMEOUT},
    snapshots::{FetchedSnapshot, SnapshotStore},
    transfer::{remove_quietly, TransferMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RestoreStep {
    Validating,
    Fetching,
    HealthChecking,
    Writing,
    Extracting,
    PublishingLatest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored_from: String,
    pub new_snapshot_key: Option<String>,
    pub mode: TransferMode,
}

fn at(step: RestoreStep) -> impl FnOnce(SandboxError) -> SandboxError {
    move |source| SandboxError::Restore {
        step,
        source: Box::new(source),
    }
}

pub struct RestoreEngine {
    store: Arc<SnapshotStore>,
    health: HealthGate,
}

impl RestoreEngine {
    pub fn new(store: Arc<SnapshotStore>, health: HealthGate) -> Self {
        Self { store, health }
    }

    pub async fn restore(
        &self,
        sandbox: &dyn Sandbox,
        scope: &TenantScope,
        key: &str,
        mark_as_latest: bool,
    ) -> Result<RestoreReport> {
        self.store
            .validate_access(scope, key)
            .map_err(at(RestoreStep::Validating))?;

        // the archive is fetched before the sandbox is touched
        let snapshot = self
            .store
            .get(scope, key)
            .await
            .and_then(|fetched| fetched.ok_or_else(|| SandboxError::NotFound(key.to_string())))
            .map_err(at(RestoreStep::Fetching))?;

        self.health
            .require_healthy(sandbox)
            .await
            .map_err(at(RestoreStep::HealthChecking))?;

        let archive_path = self.store.packager().archive_path(sandbox);
        let mode = match self
            .store
            .transfer()
            .write_into(sandbox, &archive_path, &snapshot.data)
            .await
        {
            Ok(mode) => mode,
            Err(e) => {
                remove_quietly(sandbox, &archive_path).await;
                remove_quietly(sandbox, &format!("{}.part", archive_path)).await;
                return Err(at(RestoreStep::Writing)(e));
            }
        };

        self.extract(sandbox, &snapshot, &archive_path)
            .await
            .map_err(at(RestoreStep::Extracting))?;
        info!(sandbox_id = sandbox.id(), key, %mode, "snapshot restored");

        let new_snapshot_key = if mark_as_latest {
            Some(
                self.store
                    .publish_copy(scope, &snapshot)
                    .await
                    .map_err(at(RestoreStep::PublishingLatest))?,
            )
        } else {
            None
        };

        Ok(RestoreReport {
            restored_from: key.to_string(),
            new_snapshot_key,
            mode,
        })
    }

    /// Restore the tenant's newest snapshot. `None` when there is nothing
    /// to restore.
    pub async fn restore_latest(
        &self,
        sandbox: &dyn Sandbox,
        scope: &TenantScope,
    ) -> Result<Option<RestoreReport>> {
        let Some(latest) = self
            .store
            .latest(scope)
            .await
            .map_err(at(RestoreStep::Fetching))?
        else {
            return Ok(None);
        };
        self.restore(sandbox, scope, &latest.key, false)
            .await
            .map(Some)
    }

    async fn extract(
        &self,
        sandbox: &dyn Sandbox,
        snapshot: &FetchedSnapshot,
        archive_path: &str,
    ) -> Result<()> {
        let directories = snapshot
            .metadata
            .as_ref()
            .map(|m| m.directories.clone())
            .filter(|dirs| !dirs.is_empty())
            .unwrap_or_else(|| self.store.packager().directories().to_vec());

        // clear, extract and clean up in one step; extraction runs even if
        // clearing only partly succeeded
        let command = format!(
            "{clear}; tar -xzf {archive} -C {root}; status=$?; rm -f {archive}; exit $status",
            clear = self
                .store
                .packager()
                .clear_command(sandbox.root(), &directories),
            archive = shell_quote(archive_path),
            root = shell_quote(sandbox.root()),
        );
        let output = match sandbox.exec(&command, ARCHIVE_EXEC_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                remove_quietly(sandbox, archive_path).await;
                return Err(SandboxError::transfer("extract archive", e));
            }
        };
        if !output.success() {
            warn!(
                sandbox_id = sandbox.id(),
                key = %snapshot.key,
                diagnostic = %output.diagnostic(),
                "extraction failed, watched directories may be partially cleared"
            );
            return Err(SandboxError::ArchiveFailure {
                step: "extract archive",
                diagnostic: output.diagnostic(),
            });
        }
        Ok(())
    }
}
