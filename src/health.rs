//! Liveness gate run before any stateful sandbox operation.
//!
//! Sleeping sandboxes wake on the first command they receive, so the first
//! probe often fails. Probes are strictly sequential with a linear backoff
//! between them, giving the instance time to finish waking.

use std::time::Duration;

use anyhow::anyhow;
use tracing::{info, warn};

use crate::{
    config::HealthGateConfig,
    error::{Result, SandboxError},
    retry::retry_with_linear_backoff,
    sandbox::Sandbox,
};

const PROBE_COMMAND: &str = "echo ok";

#[derive(Debug, Clone)]
pub struct HealthGate {
    attempts: u32,
    probe_timeout: Duration,
    backoff_step: Duration,
}

impl HealthGate {
    pub fn new(config: &HealthGateConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            probe_timeout: config.probe_timeout(),
            backoff_step: config.backoff_step(),
        }
    }

    /// Returns whether the sandbox executed a trivial command within the
    /// configured number of attempts.
    pub async fn ensure_healthy(&self, sandbox: &dyn Sandbox) -> bool {
        let result = retry_with_linear_backoff(
            self.attempts - 1,
            self.backoff_step,
            &format!("health probe for {}", sandbox.id()),
            || self.probe(sandbox),
            |_: &anyhow::Error| true,
        )
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    sandbox_id = sandbox.id(),
                    attempts = self.attempts,
                    error = %e,
                    "sandbox failed all health probes"
                );
                false
            }
        }
    }

    /// Like [`HealthGate::ensure_healthy`], but an unhealthy sandbox is an
    /// `Unavailable` error.
    pub async fn require_healthy(&self, sandbox: &dyn Sandbox) -> Result<()> {
        if self.ensure_healthy(sandbox).await {
            Ok(())
        } else {
            Err(SandboxError::Unavailable {
                sandbox_id: sandbox.id().to_string(),
                attempts: self.attempts,
            })
        }
    }

    async fn probe(&self, sandbox: &dyn Sandbox) -> anyhow::Result<()> {
        let output = tokio::time::timeout(
            self.probe_timeout,
            sandbox.exec(PROBE_COMMAND, self.probe_timeout),
        )
        .await
        .map_err(|_| anyhow!("probe timed out after {:?}", self.probe_timeout))??;
        if !output.success() {
            return Err(anyhow!("probe exited with {}", output.diagnostic()));
        }
        info!(sandbox_id = sandbox.id(), "sandbox is healthy");
        Ok(())
    }
}
