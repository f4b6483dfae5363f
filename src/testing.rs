use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blob_store::BlobStorageConfig;
use bytes::Bytes;
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{SandboxesConfig, ServerConfig},
    sandbox::{
        ExecOutput,
        FileEncoding,
        HttpReply,
        ProcessInfo,
        Sandbox,
        SandboxProvider,
        StartProcess,
        WaitForPort,
    },
    service::Service,
};

pub struct TestService {
    pub service: Service,
    pub temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default()).await
    }

    /// Build a service rooted in a fresh temp dir. Storage and sandbox
    /// locations in `config` are replaced.
    pub async fn with_config(config: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let cfg = ServerConfig {
            blob_storage: BlobStorageConfig::new(
                temp_dir
                    .path()
                    .join("blob_store")
                    .to_str()
                    .ok_or_else(|| anyhow!("temp dir is not utf-8"))?,
            ),
            sandboxes: SandboxesConfig {
                base_dir: temp_dir.path().join("sandboxes"),
            },
            ..config
        };
        std::fs::create_dir_all(temp_dir.path().join("blob_store"))?;
        let service = Service::new(cfg).await?;
        Ok(Self { service, temp_dir })
    }

    /// Root directory of a host sandbox.
    pub fn sandbox_root(&self, sandbox_id: &str) -> std::path::PathBuf {
        self.temp_dir.path().join("sandboxes").join(sandbox_id)
    }
}

#[derive(Default)]
struct FakeState {
    exec_count: u32,
    fail_next: u32,
    hang_next: u32,
    failing_patterns: Vec<String>,
    commands: Vec<String>,
    exec_stdout: String,
    files: HashMap<String, String>,
    processes: Vec<ProcessInfo>,
    started: Vec<StartProcess>,
    commands_at_start: Vec<usize>,
    killed: Vec<u32>,
    next_pid: u32,
    port_never_ready: bool,
    requests_fail: bool,
    requests: Vec<Bytes>,
}

/// Scripted in-memory sandbox. Commands succeed unless told otherwise;
/// files and processes exist only in memory.
#[derive(Debug)]
pub struct FakeSandbox {
    id: String,
    state: Mutex<FakeState>,
}

impl std::fmt::Debug for FakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeState")
            .field("exec_count", &self.exec_count)
            .field("processes", &self.processes)
            .finish()
    }
}

impl FakeSandbox {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(FakeState {
                next_pid: 100,
                ..Default::default()
            }),
        }
    }

    pub fn shared(id: &str) -> Arc<Self> {
        Arc::new(Self::new(id))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// The next `n` commands fail at the transport level.
    pub fn fail_next_execs(&self, n: u32) {
        self.with_state(|s| s.fail_next = n);
    }

    /// The next `n` commands never complete.
    pub fn hang_next_execs(&self, n: u32) {
        self.with_state(|s| s.hang_next = n);
    }

    /// Commands containing `pattern` exit with status 1.
    pub fn fail_commands_containing(&self, pattern: &str) {
        self.with_state(|s| s.failing_patterns.push(pattern.to_string()));
    }

    pub fn set_exec_stdout(&self, stdout: &str) {
        self.with_state(|s| s.exec_stdout = stdout.to_string());
    }

    pub fn set_port_never_ready(&self) {
        self.with_state(|s| s.port_never_ready = true);
    }

    pub fn fail_requests(&self) {
        self.with_state(|s| s.requests_fail = true);
    }

    pub fn add_process(&self, command: &str) -> u32 {
        self.with_state(|s| {
            s.next_pid += 1;
            let pid = s.next_pid;
            s.processes.push(ProcessInfo {
                pid,
                command: command.to_string(),
            });
            pid
        })
    }

    pub fn exec_count(&self) -> u32 {
        self.with_state(|s| s.exec_count)
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|s| s.commands.clone())
    }

    pub fn written_files(&self) -> Vec<String> {
        self.with_state(|s| s.files.keys().cloned().collect())
    }

    pub fn started(&self) -> Vec<StartProcess> {
        self.with_state(|s| s.started.clone())
    }

    /// Commands that had run by the time the first process was started.
    pub fn commands_before_start(&self) -> Vec<String> {
        self.with_state(|s| match s.commands_at_start.first() {
            Some(n) => s.commands[..*n].to_vec(),
            None => s.commands.clone(),
        })
    }

    pub fn killed(&self) -> Vec<u32> {
        self.with_state(|s| s.killed.clone())
    }

    pub fn requests(&self) -> Vec<Bytes> {
        self.with_state(|s| s.requests.clone())
    }
}

enum ExecScript {
    Fail,
    Hang,
    Run(ExecOutput),
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &str {
        "/"
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        let script = self.with_state(|s| {
            s.exec_count += 1;
            s.commands.push(command.to_string());
            if s.hang_next > 0 {
                s.hang_next -= 1;
                return ExecScript::Hang;
            }
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return ExecScript::Fail;
            }
            let failing = s.failing_patterns.iter().any(|p| command.contains(p));
            ExecScript::Run(ExecOutput {
                exit_code: if failing { 1 } else { 0 },
                stdout: if command == "echo ok" {
                    "ok\n".to_string()
                } else {
                    s.exec_stdout.clone()
                },
                stderr: String::new(),
            })
        });
        match script {
            ExecScript::Fail => Err(anyhow!("sandbox is waking up")),
            ExecScript::Hang => std::future::pending().await,
            ExecScript::Run(output) => Ok(output),
        }
    }

    async fn write_file(&self, path: &str, content: &str, _encoding: FileEncoding) -> Result<()> {
        self.with_state(|s| s.files.insert(path.to_string(), content.to_string()));
        Ok(())
    }

    async fn read_file(&self, path: &str, _encoding: FileEncoding) -> Result<String> {
        self.with_state(|s| s.files.get(path).cloned())
            .ok_or_else(|| anyhow!("no such file: {}", path))
    }

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.with_state(|s| s.processes.clone()))
    }

    async fn start_process(&self, request: StartProcess) -> Result<ProcessInfo> {
        let pid = self.add_process(&request.command);
        self.with_state(|s| {
            s.started.push(request.clone());
            s.commands_at_start.push(s.commands.len());
        });
        Ok(ProcessInfo {
            pid,
            command: request.command,
        })
    }

    async fn wait_for_port(&self, _process: &ProcessInfo, wait: WaitForPort) -> Result<()> {
        if self.with_state(|s| s.port_never_ready) {
            return Err(anyhow!(
                "Timeout waiting for port {} after {:?}",
                wait.port,
                wait.timeout
            ));
        }
        Ok(())
    }

    async fn request(
        &self,
        _port: u16,
        _path: &str,
        body: Bytes,
        _timeout: Duration,
    ) -> Result<HttpReply> {
        let fail = self.with_state(|s| {
            s.requests.push(body.clone());
            s.requests_fail
        });
        if fail {
            return Err(anyhow!("connection refused"));
        }
        let mut reply = b"handled:".to_vec();
        reply.extend_from_slice(&body);
        Ok(HttpReply {
            status: 200,
            body: Bytes::from(reply),
        })
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        self.with_state(|s| {
            s.processes.retain(|p| p.pid != pid);
            s.killed.push(pid);
        });
        Ok(())
    }
}

/// Hands out one shared [`FakeSandbox`] for every id and records destroys.
pub struct FakeProvider {
    sandbox: Arc<FakeSandbox>,
    destroyed: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(sandbox: Arc<FakeSandbox>) -> Self {
        Self {
            sandbox,
            destroyed: Mutex::new(Vec::new()),
        }
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn sandbox(&self, _sandbox_id: &str) -> Result<Arc<dyn Sandbox>> {
        let sandbox: Arc<dyn Sandbox> = self.sandbox.clone();
        Ok(sandbox)
    }

    async fn exists(&self, sandbox_id: &str) -> Result<bool> {
        Ok(!self.destroyed().iter().any(|id| id == sandbox_id))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        self.destroyed.lock().unwrap().push(sandbox_id.to_string());
        Ok(())
    }
}
