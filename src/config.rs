use std::{env, fmt::Debug, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub listen_addr: String,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
    pub blob_storage: BlobStorageConfig,
    pub sandboxes: SandboxesConfig,
    pub archive: ArchiveConfig,
    pub transfer: TransferConfig,
    pub health: HealthGateConfig,
    pub supervisor: SupervisorConfig,
    pub cache: CacheConfig,
    pub idle: IdleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: "local".to_string(),
            listen_addr: "0.0.0.0:8910".to_string(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
            blob_storage: BlobStorageConfig::default(),
            sandboxes: SandboxesConfig::default(),
            archive: ArchiveConfig::default(),
            transfer: TransferConfig::default(),
            health: HealthGateConfig::default(),
            supervisor: SupervisorConfig::default(),
            cache: CacheConfig::default(),
            idle: IdleConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(&config_str))
            .merge(Env::prefixed("SANDKEEP_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        self.archive.validate()?;
        self.transfer.validate()?;
        if self.health.attempts == 0 {
            return Err(anyhow!("health.attempts must be at least 1"));
        }
        if self.supervisor.signature.trim().is_empty() {
            return Err(anyhow!("supervisor.signature must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxesConfig {
    /// Directory holding one root directory per host sandbox.
    pub base_dir: PathBuf,
}

impl Default for SandboxesConfig {
    fn default() -> Self {
        SandboxesConfig {
            base_dir: env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("sandkeep_storage/sandboxes"),
        }
    }
}

/// What gets archived. Directory paths and exclusion patterns are relative
/// to the sandbox root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub directories: Vec<String>,
    pub excludes: Vec<String>,
    pub temp_path: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            directories: vec![
                "root/.claude".to_string(),
                "root/.config".to_string(),
                "workspace".to_string(),
            ],
            excludes: vec![
                "*/node_modules".to_string(),
                "*/.cache".to_string(),
                "*/.npm/_cacache".to_string(),
                "*/models".to_string(),
                "*/.ollama".to_string(),
                "workspace/mnt".to_string(),
                "*/MEMORY.md".to_string(),
            ],
            temp_path: "tmp/sandkeep-snapshot.tar.gz".to_string(),
        }
    }
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.directories.is_empty() {
            return Err(anyhow!("archive.directories must not be empty"));
        }
        for dir in self.directories.iter().chain(std::iter::once(&self.temp_path)) {
            if dir.starts_with('/') || dir.split('/').any(|s| s == "..") {
                return Err(anyhow!(
                    "archive paths must be relative to the sandbox root: {}",
                    dir
                ));
            }
            if dir.contains(',') || dir.contains('\'') {
                return Err(anyhow!("archive path contains unsupported characters: {}", dir));
            }
        }
        if self.excludes.iter().any(|e| e.contains('\'')) {
            return Err(anyhow!("archive.excludes must not contain single quotes"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Archives at or above this size move in chunks rather than one call.
    pub streaming_threshold_bytes: u64,
    /// Raw bytes per chunk when streaming.
    pub chunk_size_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            streaming_threshold_bytes: 5 * 1024 * 1024,
            chunk_size_bytes: 768 * 1024,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 || self.chunk_size_bytes % 3 != 0 {
            return Err(anyhow!(
                "transfer.chunk_size_bytes must be a non-zero multiple of 3, got {}",
                self.chunk_size_bytes
            ));
        }
        if self.streaming_threshold_bytes == 0 {
            return Err(anyhow!("transfer.streaming_threshold_bytes must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthGateConfig {
    pub attempts: u32,
    pub probe_timeout_secs: u64,
    /// Delay before retry `n` is `n * backoff_step_secs`.
    pub backoff_step_secs: u64,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        HealthGateConfig {
            attempts: 3,
            probe_timeout_secs: 15,
            backoff_step_secs: 1,
        }
    }
}

impl HealthGateConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_secs(self.backoff_step_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Command line used to launch the persistent agent process.
    pub command: String,
    /// Substring identifying the persistent process in a process listing.
    pub signature: String,
    pub port: u16,
    pub health_path: String,
    pub startup_timeout_secs: u64,
    pub home_dir: String,
    pub default_timezone: String,
    /// Environment variable the tenant's provider credential is exported as.
    pub credential_env: String,
    /// One-shot command used when the persistent process is unreachable.
    /// Receives the work payload on stdin.
    pub oneshot_command: String,
    /// Path on the persistent process that accepts work.
    pub work_path: String,
    pub work_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            command: "node /opt/agent/server.js".to_string(),
            signature: "/opt/agent/server.js".to_string(),
            port: 8080,
            health_path: "/health".to_string(),
            startup_timeout_secs: 60,
            home_dir: "/root".to_string(),
            default_timezone: "UTC".to_string(),
            credential_env: "ANTHROPIC_API_KEY".to_string(),
            oneshot_command: "node /opt/agent/oneshot.js".to_string(),
            work_path: "/work".to_string(),
            work_timeout_secs: 600,
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn work_timeout(&self) -> Duration {
        Duration::from_secs(self.work_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub endpoint_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            endpoint_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub enabled: bool,
    pub idle_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        IdleConfig {
            enabled: true,
            idle_after_secs: 15 * 60,
            sweep_interval_secs: 60,
        }
    }
}
