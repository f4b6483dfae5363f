//! Handles onto ephemeral compute sandboxes.
//!
//! A sandbox is addressed by id (`chat-<chatId>`) and obtained fresh from a
//! [`SandboxProvider`] on every call; nothing here owns its lifetime. The
//! [`Sandbox`] trait is the whole contract the snapshot and supervisor code
//! relies on: run a shell command, move text files in and out, and manage
//! processes.

mod host;

use std::{collections::HashMap, fmt::Debug, ops::Range, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
pub use host::{HostSandbox, HostSandboxProvider};

/// Timeout for ordinary bookkeeping commands (stat, mkdir, rm).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for archive creation and extraction.
pub const ARCHIVE_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    Utf8,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The most useful text to show when a command failed.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.exit_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
}

#[derive(Debug, Clone, Default)]
pub struct StartProcess {
    pub command: String,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct WaitForPort {
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
    pub status_range: Range<u16>,
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Bytes,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync + Debug {
    fn id(&self) -> &str;

    /// Filesystem root that relative archive paths resolve against.
    fn root(&self) -> &str;

    /// Run `command` through a POSIX shell. Times out with an error.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    async fn write_file(&self, path: &str, content: &str, encoding: FileEncoding) -> Result<()>;

    async fn read_file(&self, path: &str, encoding: FileEncoding) -> Result<String>;

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>>;

    async fn start_process(&self, request: StartProcess) -> Result<ProcessInfo>;

    /// Block until `GET http://localhost:<port><path>` answers with a status
    /// in `status_range`, or fail once `timeout` elapses.
    async fn wait_for_port(&self, process: &ProcessInfo, wait: WaitForPort) -> Result<()>;

    /// POST `body` to a port inside the sandbox. Errors only on transport
    /// failure; any HTTP status is returned as a reply.
    async fn request(
        &self,
        port: u16,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpReply>;

    async fn kill_process(&self, pid: u32) -> Result<()>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Resolve a live handle, waking the sandbox if the substrate needs to.
    async fn sandbox(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>>;

    /// Whether the sandbox exists without creating or waking it.
    async fn exists(&self, sandbox_id: &str) -> Result<bool>;

    async fn destroy(&self, sandbox_id: &str) -> Result<()>;
}

/// Absolute path of `relative` inside a sandbox rooted at `root`.
pub fn resolve(root: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if root == "/" || root.is_empty() {
        format!("/{}", relative)
    } else {
        format!("{}/{}", root.trim_end_matches('/'), relative)
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
