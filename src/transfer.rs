//! Moves archive bytes between object storage and a sandbox.
//!
//! Sandbox calls have small per-call limits, so archives at or above the
//! streaming threshold move as an ordered sequence of bounded chunks. Smaller
//! archives go in a single buffered call. Every chunk passes through the
//! chunked codec so no single encode or decode scales with archive size.

use std::collections::HashMap;

use anyhow::anyhow;
use blob_store::{BlobStorage, PutResult};
use bytes::Bytes;
use sandkeep_utils::{decode_chunked, encode_chunked};
use tracing::{debug, warn};

use crate::{
    config::TransferConfig,
    error::{Result, SandboxError},
    sandbox::{shell_quote, FileEncoding, Sandbox, DEFAULT_EXEC_TIMEOUT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransferMode {
    Buffered,
    Streamed,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    streaming_threshold: u64,
    chunk_size: usize,
}

impl Transfer {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            streaming_threshold: config.streaming_threshold_bytes,
            chunk_size: config.chunk_size_bytes,
        }
    }

    pub fn mode_for(&self, size: u64) -> TransferMode {
        if size >= self.streaming_threshold {
            TransferMode::Streamed
        } else {
            TransferMode::Buffered
        }
    }

    /// Write `data` to `path` inside the sandbox, replacing any previous
    /// content (a temp file left by an interrupted transfer is overwritten).
    pub async fn write_into(
        &self,
        sandbox: &dyn Sandbox,
        path: &str,
        data: &Bytes,
    ) -> Result<TransferMode> {
        let mode = self.mode_for(data.len() as u64);
        match mode {
            TransferMode::Buffered => {
                sandbox
                    .write_file(path, &encode_chunked(data), FileEncoding::Base64)
                    .await
                    .map_err(|e| SandboxError::transfer("write archive", e))?;
            }
            TransferMode::Streamed => self.write_chunks(sandbox, path, data).await?,
        }
        debug!(
            sandbox_id = sandbox.id(),
            path,
            size = data.len(),
            %mode,
            "archive written into sandbox"
        );
        Ok(mode)
    }

    async fn write_chunks(&self, sandbox: &dyn Sandbox, path: &str, data: &Bytes) -> Result<()> {
        let part_path = format!("{}.part", path);
        let quoted_part = shell_quote(&part_path);
        let quoted_dest = shell_quote(path);
        for (index, chunk) in data.chunks(self.chunk_size).enumerate() {
            sandbox
                .write_file(&part_path, &encode_chunked(chunk), FileEncoding::Base64)
                .await
                .map_err(|e| SandboxError::transfer("write archive chunk", e))?;
            // the first chunk truncates whatever an earlier attempt left behind
            let redirect = if index == 0 { ">" } else { ">>" };
            let command = format!(
                "cat {part} {redirect} {dest} && rm -f {part}",
                part = quoted_part,
                redirect = redirect,
                dest = quoted_dest,
            );
            let output = sandbox
                .exec(&command, DEFAULT_EXEC_TIMEOUT)
                .await
                .map_err(|e| SandboxError::transfer("append archive chunk", e))?;
            if !output.success() {
                return Err(SandboxError::transfer(
                    "append archive chunk",
                    anyhow!("chunk {} failed: {}", index, output.diagnostic()),
                ));
            }
        }
        Ok(())
    }

    /// Upload the `size`-byte file at `path` inside the sandbox to `key`.
    pub async fn upload_from(
        &self,
        sandbox: &dyn Sandbox,
        path: &str,
        size: u64,
        storage: &BlobStorage,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(TransferMode, PutResult)> {
        let mode = self.mode_for(size);
        let result = match mode {
            TransferMode::Buffered => {
                let encoded = sandbox
                    .read_file(path, FileEncoding::Base64)
                    .await
                    .map_err(|e| SandboxError::transfer("read archive", e))?;
                let data = decode_chunked(&encoded)
                    .map_err(|e| SandboxError::transfer("decode archive", e))?;
                storage
                    .put_bytes(key, Bytes::from(data), metadata)
                    .await
                    .map_err(|e| SandboxError::storage("put", e))?
            }
            TransferMode::Streamed => {
                let chunks = Box::pin(self.read_chunks(sandbox, path, size));
                storage
                    .put(key, chunks, metadata)
                    .await
                    .map_err(|e| SandboxError::storage("multipart upload", e))?
            }
        };
        debug!(
            sandbox_id = sandbox.id(),
            key,
            size = result.size_bytes,
            %mode,
            "archive uploaded from sandbox"
        );
        Ok((mode, result))
    }

    fn read_chunks<'a>(
        &'a self,
        sandbox: &'a dyn Sandbox,
        path: &'a str,
        size: u64,
    ) -> impl futures::Stream<Item = anyhow::Result<Bytes>> + Send + 'a {
        let chunk_size = self.chunk_size as u64;
        async_stream::try_stream! {
            let mut offset = 0u64;
            while offset < size {
                let length = chunk_size.min(size - offset);
                let chunk = read_chunk(sandbox, path, offset, length).await?;
                offset += length;
                yield chunk;
            }
        }
    }
}

async fn read_chunk(
    sandbox: &dyn Sandbox,
    path: &str,
    offset: u64,
    length: u64,
) -> anyhow::Result<Bytes> {
    let command = format!(
        "tail -c +{} {} | head -c {} | base64 -w 0",
        offset + 1,
        shell_quote(path),
        length
    );
    let output = sandbox.exec(&command, DEFAULT_EXEC_TIMEOUT).await?;
    if !output.success() {
        return Err(anyhow!(
            "reading chunk at {} failed: {}",
            offset,
            output.diagnostic()
        ));
    }
    let chunk = decode_chunked(&output.stdout)?;
    if chunk.len() as u64 != length {
        return Err(anyhow!(
            "short read at {}: expected {} bytes, got {}",
            offset,
            length,
            chunk.len()
        ));
    }
    Ok(Bytes::from(chunk))
}

/// Best-effort removal of a file inside the sandbox.
pub async fn remove_quietly(sandbox: &dyn Sandbox, path: &str) {
    let command = format!("rm -f {}", shell_quote(path));
    match sandbox.exec(&command, DEFAULT_EXEC_TIMEOUT).await {
        Ok(output) if output.success() => {}
        Ok(output) => {
            warn!(sandbox_id = sandbox.id(), path, error = %output.diagnostic(), "failed to remove temp file")
        }
        Err(e) => warn!(sandbox_id = sandbox.id(), path, error = %e, "failed to remove temp file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{resolve, HostSandboxProvider, SandboxProvider};

    fn transfer(threshold: u64, chunk: usize) -> Transfer {
        Transfer::new(&TransferConfig {
            streaming_threshold_bytes: threshold,
            chunk_size_bytes: chunk,
        })
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from(
            (0..len)
                .map(|i| (i * 7 % 256) as u8)
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_threshold_boundary() {
        let t = transfer(1000, 300);
        assert_eq!(t.mode_for(999), TransferMode::Buffered);
        assert_eq!(t.mode_for(1000), TransferMode::Streamed);
        assert_eq!(t.mode_for(1001), TransferMode::Streamed);
    }

    #[tokio::test]
    async fn test_write_paths_produce_identical_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = HostSandboxProvider::new(dir.path().to_path_buf())?;
        let sandbox = provider.sandbox("chat-1").await?;
        let data = payload(1000);

        let buffered_path = resolve(sandbox.root(), "tmp/buffered.bin");
        let mode = transfer(1001, 300)
            .write_into(sandbox.as_ref(), &buffered_path, &data)
            .await?;
        assert_eq!(mode, TransferMode::Buffered);

        let streamed_path = resolve(sandbox.root(), "tmp/streamed.bin");
        // stale content from an interrupted transfer is replaced
        tokio::fs::write(&streamed_path, b"stale bytes that are longer than nothing").await?;
        let mode = transfer(1000, 300)
            .write_into(sandbox.as_ref(), &streamed_path, &data)
            .await?;
        assert_eq!(mode, TransferMode::Streamed);

        assert_eq!(tokio::fs::read(&buffered_path).await?, data.to_vec());
        assert_eq!(tokio::fs::read(&streamed_path).await?, data.to_vec());
        assert!(!std::path::Path::new(&format!("{}.part", streamed_path)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_paths_store_identical_bytes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = HostSandboxProvider::new(dir.path().to_path_buf())?;
        let sandbox = provider.sandbox("chat-1").await?;
        let storage = BlobStorage::new_in_memory();
        let data = payload(2000);
        let path = resolve(sandbox.root(), "tmp/archive.bin");
        tokio::fs::create_dir_all(resolve(sandbox.root(), "tmp")).await?;
        tokio::fs::write(&path, &data).await?;

        let (mode, buffered) = transfer(2001, 300)
            .upload_from(sandbox.as_ref(), &path, 2000, &storage, "a", &HashMap::new())
            .await?;
        assert_eq!(mode, TransferMode::Buffered);

        let (mode, streamed) = transfer(2000, 300)
            .upload_from(sandbox.as_ref(), &path, 2000, &storage, "b", &HashMap::new())
            .await?;
        assert_eq!(mode, TransferMode::Streamed);

        assert_eq!(buffered.sha256_hash, streamed.sha256_hash);
        assert_eq!(storage.read_bytes("a").await?, Some(data.clone()));
        assert_eq!(storage.read_bytes("b").await?, Some(data));
        Ok(())
    }

    #[tokio::test]
    async fn test_streamed_upload_fails_on_short_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = HostSandboxProvider::new(dir.path().to_path_buf())?;
        let sandbox = provider.sandbox("chat-1").await?;
        let storage = BlobStorage::new_in_memory();
        let path = resolve(sandbox.root(), "short.bin");
        tokio::fs::write(&path, payload(100)).await?;

        let err = transfer(10, 30)
            .upload_from(sandbox.as_ref(), &path, 200, &storage, "c", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Storage { .. }));
        assert!(storage.head("c").await?.is_none());
        Ok(())
    }
}
