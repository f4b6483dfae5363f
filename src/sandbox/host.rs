//! Local sandbox substrate.
//!
//! Each sandbox is a directory under the configured base dir. Commands run
//! through `sh -c` with that directory as both working directory and
//! `SANDBOX_ROOT`; archive paths resolve relative to it. Processes started
//! here are tracked in memory, so a restarted server sees no processes.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sandkeep_utils::{decode_chunked, encode_chunked};
use tokio::{
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use super::{
    ExecOutput,
    FileEncoding,
    HttpReply,
    ProcessInfo,
    Sandbox,
    SandboxProvider,
    StartProcess,
    WaitForPort,
};
use crate::retry::retry_until_deadline;

/// Interval between health endpoint polls.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

struct ManagedProcess {
    command: String,
    child: Child,
}

pub struct HostSandbox {
    id: String,
    root: String,
    processes: Mutex<HashMap<u32, ManagedProcess>>,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for HostSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSandbox")
            .field("id", &self.id)
            .field("root", &self.root)
            .finish()
    }
}

impl HostSandbox {
    pub fn new(id: &str, root: &Path, http_client: reqwest::Client) -> Result<Self> {
        let root = root
            .to_str()
            .ok_or_else(|| anyhow!("sandbox root is not valid utf-8: {}", root.display()))?
            .to_string();
        Ok(Self {
            id: id.to_string(),
            root,
            processes: Mutex::new(HashMap::new()),
            http_client,
        })
    }

    async fn kill_all(&self) {
        let mut processes = self.processes.lock().await;
        for (pid, mut process) in processes.drain() {
            if let Err(e) = process.child.kill().await {
                debug!(sandbox_id = %self.id, pid, error = %e, "process already gone");
            }
        }
    }

    async fn is_running(&self, pid: u32) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(&pid) {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn local_url(port: u16, path: &str) -> String {
        format!("http://127.0.0.1:{}/{}", port, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &str {
        &self.root
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .env("SANDBOX_ROOT", &self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("command timed out after {:?}", timeout))?
            .context("failed to spawn sh")?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn write_file(&self, path: &str, content: &str, encoding: FileEncoding) -> Result<()> {
        let bytes = match encoding {
            FileEncoding::Utf8 => content.as_bytes().to_vec(),
            FileEncoding::Base64 => decode_chunked(content)?,
        };
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path))
    }

    async fn read_file(&self, path: &str, encoding: FileEncoding) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path))?;
        match encoding {
            FileEncoding::Utf8 => Ok(String::from_utf8(bytes)?),
            FileEncoding::Base64 => Ok(encode_chunked(&bytes)),
        }
    }

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut processes = self.processes.lock().await;
        processes.retain(|_, process| matches!(process.child.try_wait(), Ok(None)));
        Ok(processes
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: *pid,
                command: process.command.clone(),
            })
            .collect())
    }

    async fn start_process(&self, request: StartProcess) -> Result<ProcessInfo> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&self.root)
            .env("SANDBOX_ROOT", &self.root)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", request.command))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("process exited before reporting a pid"))?;

        info!(sandbox_id = %self.id, pid, command = %request.command, "process started");
        self.processes.lock().await.insert(
            pid,
            ManagedProcess {
                command: request.command.clone(),
                child,
            },
        );
        Ok(ProcessInfo {
            pid,
            command: request.command,
        })
    }

    async fn wait_for_port(&self, process: &ProcessInfo, wait: WaitForPort) -> Result<()> {
        let url = Self::local_url(wait.port, &wait.path);
        let status_range = wait.status_range.clone();
        let pid = process.pid;
        retry_until_deadline(
            wait.timeout,
            POLL_INTERVAL,
            &format!("waiting for {}", url),
            || {
                let request = self.http_client.get(&url).send();
                let status_range = status_range.clone();
                async move {
                    let status = request.await?.status().as_u16();
                    if status_range.contains(&status) {
                        Ok(())
                    } else {
                        Err(anyhow!("health endpoint returned {}", status))
                    }
                }
            },
            || async move {
                if self.is_running(pid).await {
                    Ok(())
                } else {
                    Err(anyhow!("process {} exited before becoming healthy", pid))
                }
            },
        )
        .await
    }

    async fn request(
        &self,
        port: u16,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let response = self
            .http_client
            .post(Self::local_url(port, path))
            .timeout(timeout)
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(HttpReply { status, body })
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        let process = self.processes.lock().await.remove(&pid);
        match process {
            Some(mut process) => {
                process
                    .child
                    .kill()
                    .await
                    .with_context(|| format!("failed to kill {}", pid))?;
                info!(sandbox_id = %self.id, pid, "process killed");
                Ok(())
            }
            None => Err(anyhow!("no process with pid {} in {}", pid, self.id)),
        }
    }
}

/// Hands out [`HostSandbox`] handles, creating a sandbox's root directory
/// on first use.
pub struct HostSandboxProvider {
    base_dir: PathBuf,
    sandboxes: DashMap<String, Arc<HostSandbox>>,
    http_client: reqwest::Client,
}

impl HostSandboxProvider {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .context("failed to build sandbox http client")?;
        Ok(Self {
            base_dir,
            sandboxes: DashMap::new(),
            http_client,
        })
    }

    fn root_for(&self, sandbox_id: &str) -> Result<PathBuf> {
        if sandbox_id.is_empty() ||
            sandbox_id.contains('/') ||
            sandbox_id == "." ||
            sandbox_id == ".."
        {
            return Err(anyhow!("invalid sandbox id: {:?}", sandbox_id));
        }
        Ok(self.base_dir.join(sandbox_id))
    }
}

#[async_trait]
impl SandboxProvider for HostSandboxProvider {
    async fn sandbox(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>> {
        if let Some(existing) = self.sandboxes.get(sandbox_id) {
            let sandbox: Arc<dyn Sandbox> = existing.value().clone();
            return Ok(sandbox);
        }
        let root = self.root_for(sandbox_id)?;
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create sandbox root {}", root.display()))?;
        let sandbox = Arc::new(HostSandbox::new(
            sandbox_id,
            &root,
            self.http_client.clone(),
        )?);
        let sandbox: Arc<dyn Sandbox> = self
            .sandboxes
            .entry(sandbox_id.to_string())
            .or_insert(sandbox)
            .value()
            .clone();
        Ok(sandbox)
    }

    async fn exists(&self, sandbox_id: &str) -> Result<bool> {
        if self.sandboxes.contains_key(sandbox_id) {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(self.root_for(sandbox_id)?).await?)
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        let root = self.root_for(sandbox_id)?;
        if let Some((_, sandbox)) = self.sandboxes.remove(sandbox_id) {
            sandbox.kill_all().await;
        }
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(sandbox_id, error = %e, "failed to remove sandbox root");
                return Err(e.into());
            }
        }
        info!(sandbox_id, "sandbox destroyed");
        Ok(())
    }
}
