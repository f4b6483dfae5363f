use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use data_model::TenantScope;
use sandkeep_utils::{encode_chunked, get_epoch_time_in_ms};
use tracing::{info, warn};

use crate::{
    cache::{Endpoint, EndpointCache},
    config::SupervisorConfig,
    error::Result,
    lifecycle::{IdleMonitor, LifecycleManager},
    sandbox::{resolve, shell_quote, FileEncoding, Sandbox},
    supervisor::TenantSettings,
    transfer::remove_quietly,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DispatchMode {
    Persistent,
    OneShot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResponse {
    pub mode: DispatchMode,
    pub success: bool,
    pub output: String,
}

/// Hands one unit of work to a sandbox's persistent process, falling back
/// to a one-shot run when the process cannot be reached.
pub struct Dispatcher {
    lifecycle: Arc<LifecycleManager>,
    cache: Arc<EndpointCache>,
    idle: Arc<IdleMonitor>,
    config: SupervisorConfig,
}

impl Dispatcher {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        cache: Arc<EndpointCache>,
        idle: Arc<IdleMonitor>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            lifecycle,
            cache,
            idle,
            config,
        }
    }

    pub async fn dispatch(
        &self,
        scope: &TenantScope,
        settings: &TenantSettings,
        payload: Bytes,
    ) -> Result<WorkResponse> {
        self.idle.touch(scope);
        let sandbox_id = scope.sandbox_id();
        let sandbox = self.lifecycle.sandbox(scope).await?;

        let endpoint = match self.cache.get(&sandbox_id) {
            Some(endpoint) => {
                self.lifecycle
                    .health()
                    .require_healthy(sandbox.as_ref())
                    .await?;
                endpoint
            }
            None => self.lifecycle.ensure_running(scope, settings).await?.1,
        };

        match self.send(sandbox.as_ref(), &endpoint, payload.clone()).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // transport failure only; never start a second process here
                warn!(
                    sandbox_id = %sandbox_id,
                    error = %e,
                    "persistent process unreachable, running one-shot"
                );
                self.cache.invalidate(&sandbox_id);
                self.one_shot(sandbox.as_ref(), payload).await
            }
        }
    }

    async fn send(
        &self,
        sandbox: &dyn Sandbox,
        endpoint: &Endpoint,
        payload: Bytes,
    ) -> anyhow::Result<WorkResponse> {
        let reply = sandbox
            .request(
                endpoint.port,
                &endpoint.path,
                payload,
                self.config.work_timeout(),
            )
            .await?;
        Ok(WorkResponse {
            mode: DispatchMode::Persistent,
            success: reply.is_success(),
            output: String::from_utf8_lossy(&reply.body).into_owned(),
        })
    }

    async fn one_shot(&self, sandbox: &dyn Sandbox, payload: Bytes) -> Result<WorkResponse> {
        let input_path = resolve(
            sandbox.root(),
            &format!("tmp/sandkeep-work-{}.in", get_epoch_time_in_ms()),
        );
        if let Err(e) = sandbox
            .write_file(&input_path, &encode_chunked(&payload), FileEncoding::Base64)
            .await
        {
            remove_quietly(sandbox, &input_path).await;
            return Err(e.context("writing one-shot input").into());
        }

        let command = format!(
            "{oneshot} < {input}; status=$?; rm -f {input}; exit $status",
            oneshot = self.config.oneshot_command,
            input = shell_quote(&input_path),
        );
        let output = sandbox
            .exec(&command, self.config.work_timeout())
            .await
            .context("running one-shot command")?;
        info!(
            sandbox_id = sandbox.id(),
            exit_code = output.exit_code,
            "one-shot run finished"
        );
        let success = output.success();
        Ok(WorkResponse {
            mode: DispatchMode::OneShot,
            success,
            output: if success {
                output.stdout
            } else {
                output.diagnostic()
            },
        })
    }
}
