//! Tenant-scoped snapshot catalog over the blob store.
//!
//! Keys are `snapshots/<chat>/<sender|groups>/<zero-padded ms>.tar.gz`, so a
//! lexicographic comparison of keys under one prefix is a time comparison.
//! Every read path validates the caller's tenant prefix before touching
//! storage.

use std::sync::Arc;

use anyhow::anyhow;
use blob_store::{BlobStorage, ObjectInfo};
use bytes::Bytes;
use data_model::{
    select_latest,
    sort_newest_first,
    DeleteSelector,
    KeyClock,
    SnapshotInfo,
    SnapshotMetadata,
    SnapshotReason,
    TenantScope,
};
use sandkeep_utils::OptionInspectNone;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SandboxError},
    packager::{ArchivePackager, PackageOutcome, PackagedArchive},
    sandbox::{shell_quote, Sandbox, DEFAULT_EXEC_TIMEOUT},
    transfer::{remove_quietly, Transfer, TransferMode},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSnapshot {
    pub key: String,
    pub size: u64,
    pub mode: TransferMode,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(CreatedSnapshot),
    /// Not an error: the watched directories held nothing.
    NothingToSnapshot,
}

/// Catalog data for one snapshot, without its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescription {
    pub info: SnapshotInfo,
    pub metadata: Option<SnapshotMetadata>,
}

/// An archive downloaded from storage together with its catalog data.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub key: String,
    pub data: Bytes,
    pub uploaded_at: u64,
    pub metadata: Option<SnapshotMetadata>,
}

fn snapshot_info(object: ObjectInfo) -> SnapshotInfo {
    SnapshotInfo {
        key: object.key,
        size: object.size_bytes,
        uploaded_at: object.uploaded_at,
    }
}

pub struct SnapshotStore {
    storage: Arc<BlobStorage>,
    packager: ArchivePackager,
    transfer: Transfer,
    clock: KeyClock,
}

impl SnapshotStore {
    pub fn new(storage: Arc<BlobStorage>, packager: ArchivePackager, transfer: Transfer) -> Self {
        Self {
            storage,
            packager,
            transfer,
            clock: KeyClock::new(),
        }
    }

    pub fn packager(&self) -> &ArchivePackager {
        &self.packager
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    #[cfg(test)]
    pub fn storage(&self) -> &BlobStorage {
        &self.storage
    }

    /// Reject keys outside the caller's tenant namespace.
    pub fn validate_access(&self, scope: &TenantScope, key: &str) -> Result<()> {
        if scope.owns(key) {
            Ok(())
        } else {
            warn!(key, tenant = %scope, "snapshot access denied");
            Err(SandboxError::AccessDenied {
                key: key.to_string(),
                prefix: scope.prefix(),
            })
        }
    }

    /// Package the sandbox's watched directories and persist the archive.
    /// The temp archive inside the sandbox is removed whether or not the
    /// upload succeeds.
    pub async fn create(
        &self,
        sandbox: &dyn Sandbox,
        scope: &TenantScope,
        reason: SnapshotReason,
    ) -> Result<CreateOutcome> {
        let archive = match self.packager.package(sandbox).await? {
            PackageOutcome::NothingToSnapshot => return Ok(CreateOutcome::NothingToSnapshot),
            PackageOutcome::Packaged(archive) => archive,
        };
        let result = self.upload(sandbox, scope, reason, &archive).await;
        remove_quietly(sandbox, &archive.path).await;
        let created = result?;
        info!(
            key = %created.key,
            size = created.size,
            mode = %created.mode,
            tenant = %scope,
            "snapshot created"
        );
        Ok(CreateOutcome::Created(created))
    }

    async fn upload(
        &self,
        sandbox: &dyn Sandbox,
        scope: &TenantScope,
        reason: SnapshotReason,
        archive: &PackagedArchive,
    ) -> Result<CreatedSnapshot> {
        let key = self.clock.next_key(scope);
        let mut metadata = SnapshotMetadata::new(scope, archive.directories.clone(), reason);
        let expected_sha256 = archive_checksum(sandbox, &archive.path).await;
        metadata.sha256 = expected_sha256.clone();

        let (mode, put) = self
            .transfer
            .upload_from(
                sandbox,
                &archive.path,
                archive.size,
                &self.storage,
                &key,
                &metadata.to_map(),
            )
            .await?;

        if let Some(expected) = expected_sha256 {
            if expected != put.sha256_hash {
                if let Err(e) = self.storage.delete(&key).await {
                    warn!(key = %key, error = %e, "failed to delete corrupt upload");
                }
                return Err(SandboxError::transfer(
                    "verify upload",
                    anyhow!(
                        "checksum mismatch for {}: sandbox {} stored {}",
                        key,
                        expected,
                        put.sha256_hash
                    ),
                ));
            }
        }
        Ok(CreatedSnapshot {
            key,
            size: put.size_bytes,
            mode,
            sha256: put.sha256_hash,
        })
    }

    /// Newest snapshot for the tenant, or `None` when it has none.
    pub async fn latest(&self, scope: &TenantScope) -> Result<Option<SnapshotInfo>> {
        let snapshots = self.list_unsorted(scope).await?;
        Ok(select_latest(&snapshots)
            .cloned()
            .inspect_none(|| debug!(tenant = %scope, "no snapshots found")))
    }

    /// All snapshots for the tenant, newest upload first.
    pub async fn list(&self, scope: &TenantScope) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots = self.list_unsorted(scope).await?;
        sort_newest_first(&mut snapshots);
        Ok(snapshots)
    }

    async fn list_unsorted(&self, scope: &TenantScope) -> Result<Vec<SnapshotInfo>> {
        let objects = self
            .storage
            .list(&scope.prefix())
            .await
            .map_err(|e| SandboxError::storage("list", e))?;
        Ok(objects
            .into_iter()
            .filter(|object| scope.owns(&object.key))
            .map(snapshot_info)
            .collect())
    }

    /// Download a snapshot after validating tenant access. `None` when the
    /// key is well-formed but absent.
    pub async fn get(&self, scope: &TenantScope, key: &str) -> Result<Option<FetchedSnapshot>> {
        self.validate_access(scope, key)?;
        let Some(info) = self
            .storage
            .head(key)
            .await
            .map_err(|e| SandboxError::storage("head", e))?
        else {
            return Ok(None);
        };
        let Some(data) = self
            .storage
            .read_bytes(key)
            .await
            .map_err(|e| SandboxError::storage("get", e))?
        else {
            return Ok(None);
        };
        let metadata = self.metadata(key).await?;
        Ok(Some(FetchedSnapshot {
            key: key.to_string(),
            data,
            uploaded_at: info.uploaded_at,
            metadata,
        }))
    }

    /// Size, upload time and metadata of one snapshot after validating
    /// tenant access. Nothing is downloaded.
    pub async fn describe(
        &self,
        scope: &TenantScope,
        key: &str,
    ) -> Result<Option<SnapshotDescription>> {
        self.validate_access(scope, key)?;
        let Some(object) = self
            .storage
            .head(key)
            .await
            .map_err(|e| SandboxError::storage("head", e))?
        else {
            return Ok(None);
        };
        let metadata = self.metadata(key).await?;
        Ok(Some(SnapshotDescription {
            info: snapshot_info(object),
            metadata,
        }))
    }

    async fn metadata(&self, key: &str) -> Result<Option<SnapshotMetadata>> {
        match self.storage.get_metadata(key).await {
            Ok(Some(map)) => Ok(SnapshotMetadata::from_map(&map)
                .inspect_err(|e| warn!(key, error = %e, "ignoring unreadable snapshot metadata"))
                .ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(SandboxError::storage("get metadata", e)),
        }
    }

    /// Delete one key or every key in the tenant's namespace. Returns the
    /// deleted keys.
    pub async fn delete(
        &self,
        scope: &TenantScope,
        selector: &DeleteSelector,
    ) -> Result<Vec<String>> {
        let keys = match selector {
            DeleteSelector::Key(key) => {
                self.validate_access(scope, key)?;
                let exists = self
                    .storage
                    .head(key)
                    .await
                    .map_err(|e| SandboxError::storage("head", e))?
                    .is_some();
                if !exists {
                    return Err(SandboxError::NotFound(key.clone()));
                }
                vec![key.clone()]
            }
            DeleteSelector::All => self
                .list_unsorted(scope)
                .await?
                .into_iter()
                .map(|snapshot| snapshot.key)
                .collect(),
        };
        for key in &keys {
            self.storage
                .delete(key)
                .await
                .map_err(|e| SandboxError::storage("delete", e))?;
        }
        info!(tenant = %scope, count = keys.len(), "snapshots deleted");
        Ok(keys)
    }

    /// Store the exact bytes of `source` under a fresh key, recording where
    /// they came from.
    pub async fn publish_copy(
        &self,
        scope: &TenantScope,
        source: &FetchedSnapshot,
    ) -> Result<String> {
        let key = self.clock.next_key(scope);
        let directories = source
            .metadata
            .as_ref()
            .map(|m| m.directories.clone())
            .unwrap_or_else(|| self.packager.directories().to_vec());
        let mut metadata =
            SnapshotMetadata::new(scope, directories, SnapshotReason::RestoreMarkLatest);
        metadata.restored_from = Some(source.key.clone());
        metadata.original_uploaded_at = Some(source.uploaded_at);

        let put = self
            .storage
            .put_bytes(&key, source.data.clone(), &metadata.to_map())
            .await
            .map_err(|e| SandboxError::storage("put", e))?;
        info!(
            key = %key,
            restored_from = %source.key,
            size = put.size_bytes,
            "published restored snapshot as latest"
        );
        Ok(key)
    }
}

/// sha256 of the archive as seen inside the sandbox. Missing tooling only
/// skips verification.
async fn archive_checksum(sandbox: &dyn Sandbox, path: &str) -> Option<String> {
    let command = format!("sha256sum {} | cut -d ' ' -f 1", shell_quote(path));
    match sandbox.exec(&command, DEFAULT_EXEC_TIMEOUT).await {
        Ok(output) if output.success() => {
            let digest = output.stdout.trim();
            (digest.len() == 64).then(|| digest.to_string())
        }
        Ok(output) => {
            warn!(sandbox_id = sandbox.id(), error = %output.diagnostic(), "could not checksum archive");
            None
        }
        Err(e) => {
            warn!(sandbox_id = sandbox.id(), error = %e, "could not checksum archive");
            None
        }
    }
}
