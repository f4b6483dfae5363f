use std::{collections::HashMap, env, fmt::Debug, sync::Arc};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    memory::InMemory,
    parse_url,
    parse_url_opts,
    path::Path,
    ObjectMeta,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use url::Url;

/// Blobs and their metadata sidecars live in separate namespaces so that
/// prefix listings only ever see blobs.
const BLOBS_DIR: &str = "blobs";
const METADATA_DIR: &str = "metadata";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub path: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: Some(format!("file://{}", path)),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = format!(
            "file://{}",
            env::current_dir()
                .unwrap_or_else(|_| std::path::PathBuf::from("."))
                .join("sandkeep_storage/snapshots")
                .to_str()
                .unwrap_or("./sandkeep_storage/snapshots")
        );
        info!("using blob store path: {}", blob_store_path);
        BlobStorageConfig {
            path: Some(blob_store_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub key: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// A listed object, keyed relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub uploaded_at: u64,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
}

impl Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("path", &self.path)
            .finish()
    }
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url = config
            .path
            .clone()
            .ok_or_else(|| anyhow!("blob storage path is required"))?;
        let (object_store, path) = Self::build_object_store(&url)?;
        Ok(Self {
            object_store: Arc::new(object_store),
            path,
        })
    }

    pub fn new_in_memory() -> Self {
        Self {
            object_store: Arc::new(InMemory::new()),
            path: Path::default(),
        }
    }

    pub fn build_object_store(url_str: &str) -> Result<(Box<dyn ObjectStore>, Path)> {
        let url = &url_str.parse::<Url>()?;
        let (scheme, _) = ObjectStoreScheme::parse(url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                            if key.starts_with("AWS_") {
                                if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                                    return Some((config_key, String::from(value)));
                                }
                            }
                        }
                        None
                    })
                    .collect();

                let mut s3_builder = AmazonS3Builder::new().with_url(url_str);
                for (key, value) in opts.iter() {
                    s3_builder = s3_builder.with_config(*key, value.clone());
                }
                let s3 = s3_builder
                    .build()
                    .context("failed to create s3 object store")?;
                let (_, path) = parse_url_opts(url, opts)?;
                Ok((Box::new(s3), path))
            }
            _ => Ok(parse_url(url)?),
        }
    }

    fn blob_path(&self, key: &str) -> Path {
        Path::from(format!("{}/{}/{}", self.path, BLOBS_DIR, key))
    }

    fn metadata_path(&self, key: &str) -> Path {
        Path::from(format!("{}/{}/{}.json", self.path, METADATA_DIR, key))
    }

    fn relative_key(&self, location: &Path) -> Option<String> {
        let root = Path::from(format!("{}/{}", self.path, BLOBS_DIR));
        location.prefix_match(&root).map(|parts| {
            parts
                .map(|part| part.as_ref().to_string())
                .collect::<Vec<_>>()
                .join("/")
        })
    }

    async fn put_metadata(&self, key: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let encoded = serde_json::to_vec(metadata)?;
        self.object_store
            .put(&self.metadata_path(key), PutPayload::from(encoded))
            .await
            .with_context(|| format!("error writing metadata for {}", key))?;
        Ok(())
    }

    /// Buffered single-request upload.
    pub async fn put_bytes(
        &self,
        key: &str,
        data: Bytes,
        metadata: &HashMap<String, String>,
    ) -> Result<PutResult> {
        let size_bytes = data.len() as u64;
        let hash = format!("{:x}", Sha256::digest(&data));
        self.object_store
            .put(&self.blob_path(key), PutPayload::from(data))
            .await
            .with_context(|| format!("error uploading {}", key))?;
        self.put_metadata(key, metadata).await?;
        debug!(key = key, size_bytes = size_bytes, "blob uploaded");
        Ok(PutResult {
            key: key.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    /// Streamed multipart upload. The upload is aborted if the source
    /// stream yields an error.
    pub async fn put(
        &self,
        key: &str,
        data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
        metadata: &HashMap<String, String>,
    ) -> Result<PutResult> {
        let mut hasher = Sha256::new();
        let mut hashed_stream = data.map(|item| {
            item.map(|bytes| {
                hasher.update(&bytes);
                bytes
            })
        });

        let path = self.blob_path(key);
        let m = self.object_store.put_multipart(&path).await?;
        let mut w = WriteMultipart::new(m);
        let mut size_bytes = 0;
        while let Some(chunk) = hashed_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort_err) = w.abort().await {
                        warn!(key = key, error = %abort_err, "failed to abort multipart upload");
                    }
                    return Err(e.context(format!("error streaming {}", key)));
                }
            };
            w.wait_for_capacity(1).await?;
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish().await?;
        drop(hashed_stream);

        let hash = format!("{:x}", hasher.finalize());
        self.put_metadata(key, metadata).await?;
        debug!(key = key, size_bytes = size_bytes, "blob streamed");
        Ok(PutResult {
            key: key.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<BoxStream<'static, Result<Bytes>>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let get_result = match self.object_store.get(&self.blob_path(key)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(anyhow!("can't get object {:?}: {:?}", key, e)),
        };
        let key = key.to_string();
        tokio::spawn(async move {
            let mut stream = get_result.into_stream();
            while let Some(chunk) = stream.next().await {
                let _ = tx.send(
                    chunk.map_err(|e| anyhow!("error reading object {:?}: {:?}", key.clone(), e)),
                );
            }
        });
        Ok(Some(Box::pin(UnboundedReceiverStream::new(rx))))
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(mut reader) = self.get(key).await? else {
            return Ok(None);
        };
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(Some(bytes.into()))
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        match self.object_store.get(&self.metadata_path(key)).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(anyhow!("can't get metadata for {:?}: {:?}", key, e)),
        }
    }

    pub async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self.object_store.head(&self.blob_path(key)).await {
            Ok(meta) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size_bytes: meta.size,
                uploaded_at: meta.last_modified.timestamp_millis() as u64,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(anyhow!("can't stat object {:?}: {:?}", key, e)),
        }
    }

    /// List all blobs whose key starts with `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // object stores list by path segment, so list the enclosing
        // directory and filter on the full string prefix.
        let directory = match prefix.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        };
        let list_path = Path::from(format!("{}/{}/{}", self.path, BLOBS_DIR, directory));
        let objects: Vec<ObjectMeta> = self
            .object_store
            .list(Some(&list_path))
            .try_collect()
            .await
            .with_context(|| format!("error listing {}", prefix))?;

        Ok(objects
            .into_iter()
            .filter_map(|meta| {
                let key = self.relative_key(&meta.location)?;
                key.starts_with(prefix).then(|| ObjectInfo {
                    key,
                    size_bytes: meta.size,
                    uploaded_at: meta.last_modified.timestamp_millis() as u64,
                })
            })
            .collect())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store.delete(&self.blob_path(key)).await?;
        match self.object_store.delete(&self.metadata_path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
