//! Artifact storage behind bucket-scoped object URIs.
//!
//! Buckets are resolved against a configured allow-list; URIs pointing
//! anywhere else are rejected before any network traffic happens. Uploads
//! are verified with a `head` before the caller is allowed to persist the
//! URI, which keeps invariant "every stored URI resolves" true at the
//! moment of write.

mod uri;

pub use uri::ObjectUri;

use crate::config::{ObjectBackendKind, ObjectsConfig};
use crate::{ForgeError, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, WriteMultipart};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const UPLOAD_CHUNK_BYTES: usize = 8 * 1024 * 1024;

pub struct ObjectStoreClient {
    backends: HashMap<String, Arc<dyn ObjectStore>>,
    scheme: &'static str,
    default_bucket: String,
    download_retries: u32,
    upload_retries: u32,
}

impl ObjectStoreClient {
    /// Build one backend per allow-listed bucket.
    pub fn new(config: &ObjectsConfig) -> Result<Self> {
        let mut backends: HashMap<String, Arc<dyn ObjectStore>> = HashMap::new();
        let scheme = match config.backend {
            ObjectBackendKind::Local => "file",
            ObjectBackendKind::S3 => "s3",
        };
        for bucket in &config.buckets {
            let backend: Arc<dyn ObjectStore> = match config.backend {
                ObjectBackendKind::Local => {
                    let root = config.root.join(bucket);
                    std::fs::create_dir_all(&root)?;
                    Arc::new(LocalFileSystem::new_with_prefix(&root)?)
                }
                ObjectBackendKind::S3 => Arc::new(
                    AmazonS3Builder::from_env()
                        .with_bucket_name(bucket.clone())
                        .build()?,
                ),
            };
            backends.insert(bucket.clone(), backend);
        }
        Ok(Self {
            backends,
            scheme,
            default_bucket: config.default_bucket.clone(),
            download_retries: config.download_retries.max(1),
            upload_retries: config.upload_retries.max(1),
        })
    }

    /// URI for an artifact path in the default bucket.
    pub fn artifact_uri(&self, path: &str) -> Result<ObjectUri> {
        ObjectUri::new(self.scheme, &self.default_bucket, path)
    }

    fn resolve(&self, uri: &ObjectUri) -> Result<Arc<dyn ObjectStore>> {
        self.backends.get(&uri.bucket).cloned().ok_or_else(|| {
            ForgeError::InvalidObjectUri(format!(
                "bucket {} is not in the configured allow-list",
                uri.bucket
            ))
        })
    }

    /// Stream an object to `dest_path`. Partial files never survive: writes
    /// go to a sibling `.part` file that is renamed on success and removed
    /// on every failure. Returns the byte count.
    pub async fn download(&self, uri: &ObjectUri, dest_path: &Path) -> Result<u64> {
        let store = self.resolve(uri)?;
        let location = StorePath::from(uri.path.as_str());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_download(store.as_ref(), &location, dest_path).await {
                Ok(n) => {
                    debug!("downloaded {uri} ({n} bytes) in {attempt} attempt(s)");
                    return Ok(n);
                }
                Err(e) if e.is_transient() && attempt < self.download_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "download of {uri} failed (attempt {attempt}/{}): {e}; \
                         retrying in {delay:?}",
                        self.download_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_download(
        &self,
        store: &dyn ObjectStore,
        location: &StorePath,
        dest_path: &Path,
    ) -> Result<u64> {
        let part_path = dest_path.with_extension("part");
        let result = async {
            let get = store.get(location).await?;
            let mut stream = get.into_stream();
            let mut file = tokio::fs::File::create(&part_path).await?;
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
                written += chunk.len() as u64;
            }
            tokio::io::AsyncWriteExt::flush(&mut file).await?;
            drop(file);
            tokio::fs::rename(&part_path, dest_path).await?;
            Ok::<u64, ForgeError>(written)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&part_path).await;
        }
        result
    }

    /// Stream `src_path` up to `uri`, then `head` the object and verify the
    /// stored size matches before returning.
    pub async fn upload(&self, src_path: &Path, uri: &ObjectUri) -> Result<u64> {
        let store = self.resolve(uri)?;
        let location = StorePath::from(uri.path.as_str());
        let expected = tokio::fs::metadata(src_path).await?.len();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .try_upload(store.as_ref(), &location, src_path, expected)
                .await
            {
                Ok(()) => {
                    debug!("uploaded {uri} ({expected} bytes) in {attempt} attempt(s)");
                    return Ok(expected);
                }
                Err(e) if e.is_transient() && attempt < self.upload_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "upload to {uri} failed (attempt {attempt}/{}): {e}; \
                         retrying in {delay:?}",
                        self.upload_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_upload(
        &self,
        store: &dyn ObjectStore,
        location: &StorePath,
        src_path: &Path,
        expected: u64,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(src_path).await?;
        let upload = store.put_multipart(location).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut buf = vec![0u8; UPLOAD_CHUNK_BYTES];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]);
        }
        writer.finish().await?;

        // Upload-with-verify: the URI is only trustworthy once head agrees.
        let meta = store.head(location).await?;
        if meta.size as u64 != expected {
            return Err(ForgeError::Transient {
                detail: format!(
                    "uploaded object size {} does not match source size {expected}",
                    meta.size
                ),
            });
        }
        Ok(())
    }

    /// Byte stream for gateway pass-through; never materializes the object.
    pub async fn open_read(
        &self,
        uri: &ObjectUri,
    ) -> Result<BoxStream<'static, std::result::Result<Bytes, object_store::Error>>> {
        let store = self.resolve(uri)?;
        let location = StorePath::from(uri.path.as_str());
        let get = store.get(&location).await?;
        Ok(get.into_stream())
    }

    /// Size of the object, or `None` when it does not exist.
    pub async fn head(&self, uri: &ObjectUri) -> Result<Option<u64>> {
        let store = self.resolve(uri)?;
        let location = StorePath::from(uri.path.as_str());
        match store.head(&location).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE * 2u32.saturating_pow(exp);
    delay.min(BACKOFF_CAP)
}

/// Render a byte count the way the chat surface shows dataset sizes.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
