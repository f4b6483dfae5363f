use tracing::{debug, info};

use crate::{
    config::ArchiveConfig,
    error::{Result, SandboxError},
    sandbox::{resolve, shell_quote, Sandbox, ARCHIVE_EXEC_TIMEOUT, DEFAULT_EXEC_TIMEOUT},
    transfer::remove_quietly,
};

/// A compressed archive sitting inside the sandbox, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArchive {
    pub path: String,
    pub size: u64,
    /// Watched directories that had content, in configured order.
    pub directories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOutcome {
    /// Every watched directory was absent or empty.
    NothingToSnapshot,
    Packaged(PackagedArchive),
}

/// Builds one filtered tarball from the sandbox's watched directories.
#[derive(Debug, Clone)]
pub struct ArchivePackager {
    directories: Vec<String>,
    excludes: Vec<String>,
    temp_path: String,
}

impl ArchivePackager {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            directories: config.directories.clone(),
            excludes: config.excludes.clone(),
            temp_path: config.temp_path.clone(),
        }
    }

    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    /// Absolute location of the temp archive inside `sandbox`.
    pub fn archive_path(&self, sandbox: &dyn Sandbox) -> String {
        resolve(sandbox.root(), &self.temp_path)
    }

    /// Shell fragment emptying each directory, dotfiles included, while
    /// leaving excluded trees and their parents in place. Excluded content
    /// never made it into an archive, so it has nothing to be restored from.
    /// Missing directories are skipped.
    pub fn clear_command(&self, root: &str, directories: &[String]) -> String {
        let mut keep = String::new();
        for pattern in &self.excludes {
            let pattern = if pattern.starts_with('*') {
                pattern.clone()
            } else {
                format!("*/{}", pattern.trim_start_matches('/'))
            };
            keep.push_str(&format!(
                " ! -path {} ! -path {}",
                shell_quote(&pattern),
                shell_quote(&format!("{}/*", pattern))
            ));
        }
        directories
            .iter()
            .map(|directory| {
                let path = shell_quote(&resolve(root, directory));
                format!(
                    "if [ -d {path} ]; then find {path} -mindepth 1 -depth{keep} \\( ! -type d -o -empty \\) -delete; fi",
                    path = path,
                    keep = keep
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub async fn package(&self, sandbox: &dyn Sandbox) -> Result<PackageOutcome> {
        let mut qualifying = Vec::new();
        for directory in &self.directories {
            if self.has_content(sandbox, directory).await? {
                qualifying.push(directory.clone());
            } else {
                debug!(sandbox_id = sandbox.id(), directory, "skipping empty directory");
            }
        }
        if qualifying.is_empty() {
            info!(sandbox_id = sandbox.id(), "nothing to snapshot");
            return Ok(PackageOutcome::NothingToSnapshot);
        }

        let archive_path = self.archive_path(sandbox);
        let output = sandbox
            .exec(
                &self.tar_command(sandbox.root(), &archive_path, &qualifying),
                ARCHIVE_EXEC_TIMEOUT,
            )
            .await
            .map_err(|e| SandboxError::transfer("create archive", e))?;
        if !output.success() {
            remove_quietly(sandbox, &archive_path).await;
            return Err(SandboxError::ArchiveFailure {
                step: "create archive",
                diagnostic: output.diagnostic(),
            });
        }

        let size = self.archive_size(sandbox, &archive_path).await?;
        info!(
            sandbox_id = sandbox.id(),
            size,
            directories = ?qualifying,
            "archive created"
        );
        Ok(PackageOutcome::Packaged(PackagedArchive {
            path: archive_path,
            size,
            directories: qualifying,
        }))
    }

    async fn has_content(&self, sandbox: &dyn Sandbox, directory: &str) -> Result<bool> {
        let path = shell_quote(&resolve(sandbox.root(), directory));
        let command = format!(
            "test -d {path} && test -n \"$(ls -A {path} 2>/dev/null)\"",
            path = path
        );
        let output = sandbox
            .exec(&command, DEFAULT_EXEC_TIMEOUT)
            .await
            .map_err(|e| SandboxError::transfer("inspect directories", e))?;
        Ok(output.success())
    }

    fn tar_command(&self, root: &str, archive_path: &str, directories: &[String]) -> String {
        let mut command = format!(
            "mkdir -p \"$(dirname {archive})\" && tar -czf {archive}",
            archive = shell_quote(archive_path)
        );
        for pattern in &self.excludes {
            command.push_str(&format!(" --exclude={}", shell_quote(pattern)));
        }
        // keep the temp archive out of itself when it lives under a watched dir
        command.push_str(&format!(
            " --exclude={}",
            shell_quote(self.temp_path.trim_start_matches('/'))
        ));
        command.push_str(&format!(" -C {}", shell_quote(root)));
        for directory in directories {
            command.push(' ');
            command.push_str(&shell_quote(directory.trim_start_matches('/')));
        }
        command
    }

    async fn archive_size(&self, sandbox: &dyn Sandbox, archive_path: &str) -> Result<u64> {
        let output = sandbox
            .exec(
                &format!("stat -c %s {}", shell_quote(archive_path)),
                DEFAULT_EXEC_TIMEOUT,
            )
            .await
            .map_err(|e| SandboxError::transfer("stat archive", e))?;
        if !output.success() {
            return Err(SandboxError::ArchiveFailure {
                step: "stat archive",
                diagnostic: output.diagnostic(),
            });
        }
        output.stdout.trim().parse::<u64>().map_err(|e| {
            SandboxError::transfer(
                "stat archive",
                anyhow::anyhow!("unexpected size {:?}: {}", output.stdout.trim(), e),
            )
        })
    }
}
