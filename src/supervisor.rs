//! Keeps exactly one persistent agent process per sandbox.
//!
//! There is no lock inside the sandbox: uniqueness comes from listing live
//! processes and matching the command signature before starting one.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use data_model::TenantScope;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::SupervisorConfig,
    error::{Result, SandboxError},
    restore::RestoreEngine,
    sandbox::{ProcessInfo, Sandbox, StartProcess, WaitForPort},
};

/// Per-tenant values exported into the persistent process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub timezone: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    AlreadyRunning { pid: u32 },
    Started {
        pid: u32,
        restored_from: Option<String>,
    },
}

impl ProcessState {
    pub fn pid(&self) -> u32 {
        match self {
            ProcessState::AlreadyRunning { pid } | ProcessState::Started { pid, .. } => *pid,
        }
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    restore: Arc<RestoreEngine>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, restore: Arc<RestoreEngine>) -> Self {
        Self { config, restore }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub async fn find_running(&self, sandbox: &dyn Sandbox) -> Result<Option<ProcessInfo>> {
        let processes = sandbox
            .list_processes()
            .await
            .context("listing sandbox processes")?;
        Ok(processes
            .into_iter()
            .find(|p| p.command.contains(&self.config.signature)))
    }

    pub async fn ensure_running(
        &self,
        sandbox: &dyn Sandbox,
        scope: &TenantScope,
        settings: &TenantSettings,
    ) -> Result<ProcessState> {
        if let Some(process) = self.find_running(sandbox).await? {
            debug!(
                sandbox_id = sandbox.id(),
                pid = process.pid,
                "persistent process already running"
            );
            return Ok(ProcessState::AlreadyRunning { pid: process.pid });
        }

        let restored_from = self.restore_state(sandbox, scope).await?;

        let process = sandbox
            .start_process(StartProcess {
                command: self.config.command.clone(),
                env: self.environment(settings),
            })
            .await
            .map_err(|e| SandboxError::ProcessStartup(format!("{:#}", e)))?;

        let wait = WaitForPort {
            port: self.config.port,
            path: self.config.health_path.clone(),
            timeout: self.config.startup_timeout(),
            status_range: 200..300,
        };
        if let Err(e) = sandbox.wait_for_port(&process, wait).await {
            warn!(
                sandbox_id = sandbox.id(),
                pid = process.pid,
                error = %e,
                "persistent process never became healthy"
            );
            if let Err(kill_err) = sandbox.kill_process(process.pid).await {
                debug!(pid = process.pid, error = %kill_err, "could not kill unhealthy process");
            }
            return Err(SandboxError::ProcessStartup(format!("{:#}", e)));
        }

        info!(sandbox_id = sandbox.id(), pid = process.pid, "persistent process started");
        Ok(ProcessState::Started {
            pid: process.pid,
            restored_from,
        })
    }

    /// Cold sandboxes have no local state, so try the latest snapshot. Only
    /// a missing snapshot lets the process start on an empty filesystem.
    async fn restore_state(
        &self,
        sandbox: &dyn Sandbox,
        scope: &TenantScope,
    ) -> Result<Option<String>> {
        match self.restore.restore_latest(sandbox, scope).await {
            Ok(Some(report)) => Ok(Some(report.restored_from)),
            Ok(None) => {
                debug!(sandbox_id = sandbox.id(), "no snapshot to restore, starting fresh");
                Ok(None)
            }
            Err(e) => {
                warn!(
                    sandbox_id = sandbox.id(),
                    error = %e,
                    "restore before start failed, not starting process"
                );
                Err(e)
            }
        }
    }

    fn environment(&self, settings: &TenantSettings) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), self.config.home_dir.clone());
        env.insert(
            "TZ".to_string(),
            settings
                .timezone
                .clone()
                .filter(|tz| !tz.is_empty())
                .unwrap_or_else(|| self.config.default_timezone.clone()),
        );
        if let Some(credential) = settings.credential.as_ref().filter(|c| !c.is_empty()) {
            env.insert(self.config.credential_env.clone(), credential.clone());
        }
        env
    }

    /// Kill every process matching the signature. Returns the killed pids.
    pub async fn stop(&self, sandbox: &dyn Sandbox) -> Result<Vec<u32>> {
        let processes = sandbox
            .list_processes()
            .await
            .context("listing sandbox processes")?;
        let mut killed = Vec::new();
        for process in processes
            .into_iter()
            .filter(|p| p.command.contains(&self.config.signature))
        {
            sandbox
                .kill_process(process.pid)
                .await
                .with_context(|| format!("killing process {}", process.pid))?;
            killed.push(process.pid);
        }
        if !killed.is_empty() {
            info!(sandbox_id = sandbox.id(), pids = ?killed, "persistent process stopped");
        }
        Ok(killed)
    }
}
