#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs, path::Path};

    use anyhow::Result;
    use bytes::Bytes;
    use data_model::{
        test_objects::tests::{group_scope, other_tenant_scope, private_scope},
        DeleteSelector,
        SnapshotReason,
        TenantScope,
    };
    use sha2::{Digest, Sha256};

    use crate::{
        config::ServerConfig,
        error::SandboxError,
        restore::RestoreStep,
        snapshots::{CreateOutcome, CreatedSnapshot},
        testing::TestService,
        transfer::TransferMode,
    };

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read(root: &Path, relative: &str) -> Vec<u8> {
        fs::read(root.join(relative)).unwrap()
    }

    /// Deterministic bytes that gzip cannot shrink much.
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x2545_f491;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    async fn create(test_srv: &TestService, scope: &TenantScope) -> Result<CreatedSnapshot> {
        match test_srv
            .service
            .lifecycle
            .snapshot(scope, SnapshotReason::Manual)
            .await?
        {
            CreateOutcome::Created(created) => Ok(created),
            CreateOutcome::NothingToSnapshot => anyhow::bail!("expected a snapshot"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() -> Result<()> {
        let test_srv = TestService::new().await?;
        let scope = private_scope();
        // make sure the sandbox root exists before writing into it
        test_srv.service.lifecycle.sandbox(&scope).await?;
        let root = test_srv.sandbox_root(&scope.sandbox_id());

        write(&root, "workspace/notes.txt", b"remember the milk");
        write(&root, "workspace/app/index.js", b"console.log('hi')");
        write(&root, "workspace/app/node_modules/dep/index.js", b"dep");
        write(&root, "workspace/mnt/shared.bin", b"mounted");
        write(&root, "root/.claude/settings.json", b"{\"theme\":\"dark\"}");

        let created = create(&test_srv, &scope).await?;
        assert!(created.key.starts_with("snapshots/1001/7007/"));
        assert!(created.key.ends_with(".tar.gz"));
        assert_eq!(created.mode, TransferMode::Buffered);
        let stored = test_srv
            .service
            .store
            .storage()
            .read_bytes(&created.key)
            .await?
            .unwrap();
        assert_eq!(created.sha256, format!("{:x}", Sha256::digest(&stored)));
        // temp archive cleaned up
        assert!(!root.join("tmp/sandkeep-snapshot.tar.gz").exists());

        // drift the sandbox away from the snapshot
        fs::remove_file(root.join("workspace/notes.txt"))?;
        write(&root, "workspace/stray.txt", b"should disappear");
        write(&root, "root/.claude/settings.json", b"{}");
        write(&root, "workspace/mnt/shared.bin", b"mounted, edited elsewhere");

        let report = test_srv
            .service
            .lifecycle
            .restore(&scope, &created.key, false)
            .await?;
        assert_eq!(report.restored_from, created.key);
        assert_eq!(report.new_snapshot_key, None);

        assert_eq!(read(&root, "workspace/notes.txt"), b"remember the milk");
        assert_eq!(read(&root, "workspace/app/index.js"), b"console.log('hi')");
        assert_eq!(
            read(&root, "root/.claude/settings.json"),
            b"{\"theme\":\"dark\"}"
        );
        assert!(!root.join("workspace/stray.txt").exists());
        // excluded paths are neither archived nor cleared
        assert_eq!(read(&root, "workspace/app/node_modules/dep/index.js"), b"dep");
        assert_eq!(
            read(&root, "workspace/mnt/shared.bin"),
            b"mounted, edited elsewhere"
        );
        assert!(!root.join("tmp/sandkeep-snapshot.tar.gz").exists());

        let listed = test_srv.service.store.list(&scope).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, created.key);
        assert_eq!(listed[0].size, created.size);
        Ok(())
    }

    #[tokio::test]
    async fn test_streamed_and_buffered_transfers_restore_same_content() -> Result<()> {
        let payload = noise(40 * 1024);
        let mut restored = Vec::new();

        for (threshold, expected_mode) in [
            (u64::MAX, TransferMode::Buffered),
            (1, TransferMode::Streamed),
        ] {
            let mut config = ServerConfig::default();
            config.transfer.streaming_threshold_bytes = threshold;
            config.transfer.chunk_size_bytes = 3 * 1024;
            let test_srv = TestService::with_config(config).await?;
            let scope = private_scope();
            test_srv.service.lifecycle.sandbox(&scope).await?;
            let root = test_srv.sandbox_root(&scope.sandbox_id());
            write(&root, "workspace/data.bin", &payload);

            let created = create(&test_srv, &scope).await?;
            assert_eq!(created.mode, expected_mode);

            let stored = test_srv
                .service
                .store
                .storage()
                .read_bytes(&created.key)
                .await?
                .unwrap();
            assert_eq!(stored.len() as u64, created.size);

            fs::remove_file(root.join("workspace/data.bin"))?;
            let report = test_srv
                .service
                .lifecycle
                .restore(&scope, &created.key, false)
                .await?;
            assert_eq!(report.mode, expected_mode);
            // no partial chunk files left behind
            assert!(!root.join("tmp/sandkeep-snapshot.tar.gz.part").exists());
            restored.push(read(&root, "workspace/data.bin"));
        }

        assert_eq!(restored[0], payload);
        assert_eq!(restored[1], payload);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_denies_foreign_snapshot() -> Result<()> {
        let test_srv = TestService::new().await?;
        let owner = private_scope();
        let intruder = other_tenant_scope();
        test_srv.service.lifecycle.sandbox(&owner).await?;
        test_srv.service.lifecycle.sandbox(&intruder).await?;
        write(
            &test_srv.sandbox_root(&owner.sandbox_id()),
            "workspace/secret.txt",
            b"owner only",
        );
        let intruder_root = test_srv.sandbox_root(&intruder.sandbox_id());
        write(&intruder_root, "workspace/mine.txt", b"intruder data");

        let created = create(&test_srv, &owner).await?;

        let err = test_srv
            .service
            .lifecycle
            .restore(&intruder, &created.key, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Restore {
                step: RestoreStep::Validating,
                ..
            }
        ));
        assert!(matches!(
            err.innermost(),
            SandboxError::AccessDenied { .. }
        ));
        // the intruder's sandbox was never touched
        assert_eq!(read(&intruder_root, "workspace/mine.txt"), b"intruder data");
        assert!(!intruder_root.join("workspace/secret.txt").exists());

        // listing and deleting are scoped the same way
        assert!(test_srv.service.store.list(&intruder).await?.is_empty());
        let err = test_srv
            .service
            .store
            .delete(&intruder, &DeleteSelector::Key(created.key.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::AccessDenied { .. }));
        assert!(test_srv.service.store.get(&owner, &created.key).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_all_leaves_other_tenants() -> Result<()> {
        let test_srv = TestService::new().await?;
        let private = private_scope();
        let group = group_scope();
        let other = other_tenant_scope();
        for scope in [&private, &group, &other] {
            test_srv.service.lifecycle.sandbox(scope).await?;
            write(
                &test_srv.sandbox_root(&scope.sandbox_id()),
                "workspace/file.txt",
                scope.prefix().as_bytes(),
            );
        }

        let first = create(&test_srv, &private).await?;
        let second = create(&test_srv, &private).await?;
        assert!(second.key > first.key);
        // private and group share a sandbox but not a namespace
        let group_snapshot = create(&test_srv, &group).await?;
        let other_snapshot = create(&test_srv, &other).await?;

        let mut deleted = test_srv
            .service
            .store
            .delete(&private, &DeleteSelector::All)
            .await?;
        deleted.sort();
        assert_eq!(deleted, vec![first.key, second.key]);
        assert!(test_srv.service.store.list(&private).await?.is_empty());
        assert!(test_srv.service.store.latest(&private).await?.is_none());

        let group_latest = test_srv.service.store.latest(&group).await?.unwrap();
        assert_eq!(group_latest.key, group_snapshot.key);
        let other_latest = test_srv.service.store.latest(&other).await?.unwrap();
        assert_eq!(other_latest.key, other_snapshot.key);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_sandbox_has_nothing_to_snapshot() -> Result<()> {
        let test_srv = TestService::new().await?;
        let scope = private_scope();
        test_srv.service.lifecycle.sandbox(&scope).await?;
        // an empty watched directory does not qualify either
        fs::create_dir_all(test_srv.sandbox_root(&scope.sandbox_id()).join("workspace"))?;

        let outcome = test_srv
            .service
            .lifecycle
            .snapshot(&scope, SnapshotReason::Manual)
            .await?;
        assert_eq!(outcome, CreateOutcome::NothingToSnapshot);
        assert!(test_srv.service.store.list(&scope).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_marks_copy_as_latest() -> Result<()> {
        let test_srv = TestService::new().await?;
        let scope = private_scope();
        test_srv.service.lifecycle.sandbox(&scope).await?;
        let root = test_srv.sandbox_root(&scope.sandbox_id());

        write(&root, "workspace/version.txt", b"v1");
        let first = create(&test_srv, &scope).await?;
        write(&root, "workspace/version.txt", b"v2");
        let second = create(&test_srv, &scope).await?;
        assert_eq!(
            test_srv.service.store.latest(&scope).await?.unwrap().key,
            second.key
        );

        let report = test_srv
            .service
            .lifecycle
            .restore(&scope, &first.key, true)
            .await?;
        assert_eq!(read(&root, "workspace/version.txt"), b"v1");
        let new_key = report.new_snapshot_key.unwrap();
        assert!(new_key > second.key);
        assert_eq!(
            test_srv.service.store.latest(&scope).await?.unwrap().key,
            new_key
        );

        // the copy carries the original archive bytes and its provenance
        let original = test_srv.service.store.get(&scope, &first.key).await?.unwrap();
        let copy = test_srv.service.store.get(&scope, &new_key).await?.unwrap();
        assert_eq!(copy.data, original.data);
        let metadata = copy.metadata.unwrap();
        assert_eq!(metadata.reason, SnapshotReason::RestoreMarkLatest);
        assert_eq!(metadata.restored_from.as_deref(), Some(first.key.as_str()));
        assert_eq!(test_srv.service.store.list(&scope).await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_archive_reports_extraction_failure() -> Result<()> {
        let test_srv = TestService::new().await?;
        let scope = private_scope();
        test_srv.service.lifecycle.sandbox(&scope).await?;
        let root = test_srv.sandbox_root(&scope.sandbox_id());
        write(&root, "workspace/keep.txt", b"data");

        let key = format!("{}00000000000000000001.tar.gz", scope.prefix());
        test_srv
            .service
            .store
            .storage()
            .put_bytes(
                &key,
                Bytes::from_static(b"definitely not gzip"),
                &HashMap::new(),
            )
            .await?;

        let err = test_srv
            .service
            .lifecycle
            .restore(&scope, &key, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Restore {
                step: RestoreStep::Extracting,
                ..
            }
        ));
        match err.innermost() {
            SandboxError::ArchiveFailure { diagnostic, .. } => {
                assert!(!diagnostic.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the uploaded archive is removed even though extraction failed
        assert!(!root.join("tmp/sandkeep-snapshot.tar.gz").exists());
        Ok(())
    }
}
