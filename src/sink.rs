//! Destination sinks: where artifacts end up
//!
//! [`LocalDestination`] writes through a temporary file in the target
//! directory and renames it into place, so a key never holds a partial
//! artifact. [`ObjectStoreDestination`] streams to S3 through OpenDAL with
//! server-side encryption and bounded retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opendal::{services, ErrorKind as StoreErrorKind, Operator};
use path_clean::clean;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::{Config, RetryConfig, S3Config};
use crate::error::BackupError;
use crate::retry::with_retry;
use crate::Platform;

/// Size of each streamed upload part
const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Size of each ranged read when downloading an artifact
const FETCH_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Object written by the connectivity probe
const PROBE_KEY: &str = ".repovault-probe";

/// Descriptive metadata stored alongside an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub platform: Platform,
    pub owner: String,
    pub name: String,
    pub is_private: bool,
    pub default_branch: Option<String>,

    /// Timestamp derived from the repository's history tip
    pub derived_timestamp: String,
}

impl ArtifactMetadata {
    /// Object-store user metadata
    pub fn as_user_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("platform".to_string(), self.platform.to_string()),
            ("owner".to_string(), self.owner.clone()),
            ("is_private".to_string(), self.is_private.to_string()),
            (
                "default_branch".to_string(),
                self.default_branch.clone().unwrap_or_default(),
            ),
        ])
    }
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub key: String,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the artifact bytes
    pub sha256: String,
    pub derived_timestamp: String,
}

/// An artifact already present at the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub key: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// "Write bytes at key" over a storage backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Destination: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, BackupError>;

    /// Store the file at `source` under `key`
    async fn write(
        &self,
        key: &str,
        source: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<BackupRecord, BackupError>;

    /// Every artifact whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<StoredArtifact>, BackupError>;

    /// Copy a stored artifact into a local file
    async fn fetch(&self, key: &str, target: &Path) -> Result<(), BackupError>;

    /// Check that the destination accepts writes
    async fn probe(&self) -> Result<(), BackupError>;

    fn describe(&self) -> String;
}

/// Build the destination named by the configuration
pub fn from_config(config: &Config) -> Result<Box<dyn Destination>, BackupError> {
    match (&config.destination.local_path, &config.destination.s3) {
        (Some(path), None) => Ok(Box::new(LocalDestination::new(path))),
        (None, Some(s3)) => Ok(Box::new(ObjectStoreDestination::s3(s3, config.retry.clone())?)),
        _ => Err(BackupError::Config(
            "exactly one destination must be configured".to_string(),
        )),
    }
}

fn upload_error(key: &str, message: impl std::fmt::Display) -> BackupError {
    BackupError::Upload {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Stream `reader` into `writer` while hashing; returns (bytes, hex sha256)
fn copy_with_digest(mut reader: impl Read, mut writer: impl Write) -> std::io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;

    Ok((total, hex::encode(hasher.finalize())))
}

/// Size and hex sha256 of a local file, computed the same way writes report them
pub fn file_digest(path: &Path) -> std::io::Result<(u64, String)> {
    copy_with_digest(std::fs::File::open(path)?, std::io::sink())
}

/// Artifacts on a local or mounted filesystem
#[derive(Debug, Clone)]
pub struct LocalDestination {
    root: PathBuf,
}

impl LocalDestination {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: clean(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path, refusing keys that escape the root
    fn resolve(&self, key: &str) -> Result<PathBuf, BackupError> {
        let path = clean(self.root.join(key.trim_start_matches('/')));
        if path == self.root || !path.starts_with(&self.root) {
            return Err(upload_error(key, "key resolves outside the destination root"));
        }
        Ok(path)
    }
}

fn write_atomically(source: &Path, target: &Path) -> std::io::Result<(u64, String)> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let input = std::fs::File::open(source)?;
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    let result = copy_with_digest(input, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(target).map_err(|e| e.error)?;

    Ok(result)
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else if !is_staging_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_staging_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(".tmp") || n == PROBE_KEY)
}

#[async_trait]
impl Destination for LocalDestination {
    async fn exists(&self, key: &str) -> Result<bool, BackupError> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| upload_error(key, e))
    }

    async fn write(
        &self,
        key: &str,
        source: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<BackupRecord, BackupError> {
        let target = self.resolve(key)?;
        let source = source.to_path_buf();
        let staged_target = target.clone();

        let (size_bytes, sha256) =
            tokio::task::spawn_blocking(move || write_atomically(&source, &staged_target))
                .await
                .map_err(|e| upload_error(key, e))?
                .map_err(|e| upload_error(key, e))?;

        debug!("Wrote {} bytes to {}", size_bytes, target.display());

        Ok(BackupRecord {
            key: key.to_string(),
            size_bytes,
            sha256,
            derived_timestamp: metadata.derived_timestamp.clone(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredArtifact>, BackupError> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();
        let walk_prefix = prefix.clone();

        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let start = match walk_prefix.rfind('/') {
                Some(idx) => root.join(&walk_prefix[..idx]),
                None => root.clone(),
            };
            walk_files(&start, &mut files).map(|_| files)
        })
        .await
        .map_err(|e| upload_error(&prefix, e))?
        .map_err(|e| upload_error(&prefix, e))?;

        let mut artifacts = Vec::new();
        for path in files {
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(&prefix) {
                continue;
            }

            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| upload_error(&key, e))?;
            artifacts.push(StoredArtifact {
                key,
                size_bytes: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        Ok(artifacts)
    }

    async fn fetch(&self, key: &str, target: &Path) -> Result<(), BackupError> {
        let path = self.resolve(key)?;
        tokio::fs::copy(&path, target)
            .await
            .map(|_| ())
            .map_err(|e| BackupError::Verification {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    async fn probe(&self) -> Result<(), BackupError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| upload_error(PROBE_KEY, e))?;
        let probe = self.root.join(PROBE_KEY);
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|e| upload_error(PROBE_KEY, e))?;
        tokio::fs::remove_file(&probe)
            .await
            .map_err(|e| upload_error(PROBE_KEY, e))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Artifacts in an object store behind OpenDAL
#[derive(Clone)]
pub struct ObjectStoreDestination {
    op: Operator,
    label: String,
    retry: RetryConfig,
}

impl ObjectStoreDestination {
    /// S3 bucket with AES256 server-side encryption
    ///
    /// Credentials come from the AWS environment variables or the ambient
    /// AWS config chain.
    pub fn s3(config: &S3Config, retry: RetryConfig) -> Result<Self, BackupError> {
        let mut builder = services::S3::default()
            .bucket(&config.bucket)
            .region(&config.region)
            .root("/")
            .server_side_encryption_with_s3_key();
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint(endpoint);
        }

        let op = Operator::new(builder)
            .map_err(|e| BackupError::Config(format!("invalid S3 settings: {}", e)))?
            .finish();

        Ok(Self {
            op,
            label: format!("s3://{}", config.bucket),
            retry,
        })
    }

    /// Wrap an existing operator
    pub fn from_operator(op: Operator, label: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            op,
            label: label.into(),
            retry,
        }
    }

    async fn upload_once(
        &self,
        key: &str,
        source: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<(u64, String), opendal::Error> {
        let mut file = tokio::fs::File::open(source).await.map_err(|e| {
            opendal::Error::new(StoreErrorKind::Unexpected, "failed to open artifact").set_source(e)
        })?;

        let mut request = self.op.writer_with(key).chunk(UPLOAD_CHUNK_SIZE);
        if self.op.info().full_capability().write_with_user_metadata {
            request = request.user_metadata(metadata.as_user_metadata());
        }
        let mut writer = request.await?;

        let mut hasher = Sha256::new();
        let mut total = 0u64;
        loop {
            let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
            let n = read_full(&mut file, &mut buf).await.map_err(|e| {
                opendal::Error::new(StoreErrorKind::Unexpected, "failed to read artifact")
                    .set_source(e)
            })?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            hasher.update(&buf);
            total += n as u64;
            writer.write(buf).await?;
        }
        writer.close().await?;

        Ok((total, hex::encode(hasher.finalize())))
    }
}

/// Fill `buf` as far as the file allows
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl Destination for ObjectStoreDestination {
    async fn exists(&self, key: &str) -> Result<bool, BackupError> {
        match self.op.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == StoreErrorKind::NotFound => Ok(false),
            Err(e) => Err(upload_error(key, e)),
        }
    }

    async fn write(
        &self,
        key: &str,
        source: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<BackupRecord, BackupError> {
        let label = format!("upload of {}", key);
        let (size_bytes, sha256) = with_retry(
            &self.retry,
            &label,
            || self.upload_once(key, source, metadata),
            |e: &opendal::Error| e.is_temporary(),
        )
        .await
        .map_err(|e| upload_error(key, e))?;

        info!("Uploaded {} ({} bytes) to {}", key, size_bytes, self.label);

        Ok(BackupRecord {
            key: key.to_string(),
            size_bytes,
            sha256,
            derived_timestamp: metadata.derived_timestamp.clone(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredArtifact>, BackupError> {
        let entries = self
            .op
            .list_with(prefix)
            .recursive(true)
            .await
            .map_err(|e| upload_error(prefix, e))?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.metadata().is_file())
            .filter(|entry| !entry.path().ends_with(PROBE_KEY))
            .map(|entry| StoredArtifact {
                key: entry.path().to_string(),
                size_bytes: entry.metadata().content_length(),
                modified: entry.metadata().last_modified(),
            })
            .collect())
    }

    async fn fetch(&self, key: &str, target: &Path) -> Result<(), BackupError> {
        let verification_error = |message: String| BackupError::Verification {
            key: key.to_string(),
            message,
        };

        let length = self
            .op
            .stat(key)
            .await
            .map_err(|e| verification_error(e.to_string()))?
            .content_length();
        let reader = self
            .op
            .reader(key)
            .await
            .map_err(|e| verification_error(e.to_string()))?;
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| verification_error(e.to_string()))?;

        // One chunk in memory at a time
        let mut offset = 0u64;
        while offset < length {
            let end = (offset + FETCH_CHUNK_SIZE).min(length);
            let chunk = reader
                .read(offset..end)
                .await
                .map_err(|e| verification_error(e.to_string()))?;
            if chunk.is_empty() {
                return Err(verification_error(format!(
                    "object ended at {} of {} bytes",
                    offset, length
                )));
            }
            offset += chunk.len() as u64;
            file.write_all(&chunk.to_bytes())
                .await
                .map_err(|e| verification_error(e.to_string()))?;
        }

        file.flush()
            .await
            .map_err(|e| verification_error(e.to_string()))
    }

    async fn probe(&self) -> Result<(), BackupError> {
        self.op
            .list_with("")
            .limit(1)
            .await
            .map_err(|e| upload_error("", e))?;
        self.op
            .write(PROBE_KEY, b"ok".to_vec())
            .await
            .map_err(|e| upload_error(PROBE_KEY, e))?;
        self.op
            .delete(PROBE_KEY)
            .await
            .map_err(|e| upload_error(PROBE_KEY, e))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
