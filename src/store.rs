//! The object store seam. Index artifacts are written once after a full
//! indexing pass and read many times while browsing; the trait keeps the
//! core testable against a local directory and lets the `aws` feature plug
//! in S3 without touching callers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::ResultExt;
use tokio::io::AsyncRead;

use crate::{error, Result};

/// Object-store key of a layer's gzip access index
pub fn layer_gzi_key(layer_digest: &str) -> String {
    format!("layers/{layer_digest}/index.gzi")
}

/// Object-store key of a layer's file index
pub fn layer_files_key(layer_digest: &str) -> String {
    format!("layers/{layer_digest}/files.json.gz")
}

/// Object-store key of a merged image index
pub fn image_index_key(repo: &str, digest: &str) -> String {
    format!("images/{repo}/{digest}/index.json.gz")
}

/// Byte storage at named keys. Absent keys surface as `BlobNotFound`, which
/// the browse surface maps to a 404.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a staged file
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;
    /// Upload an in-memory object
    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()>;
    /// Fetch a whole object into memory
    async fn get(&self, key: &str) -> Result<Bytes>;
    /// Open an object for streaming reads
    async fn get_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Blob store over a local directory, used by the CLI's local mode and the
/// test suite. Keys map directly onto relative paths.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::DirectorySnafu)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let target = self.path_for(key);
        self.ensure_parent(&target).await?;
        tokio::fs::copy(path, &target)
            .await
            .context(error::FileSnafu)?;
        debug!(target: "store", "stored {key}");
        Ok(())
    }

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()> {
        let target = self.path_for(key);
        self.ensure_parent(&target).await?;
        tokio::fs::write(&target, body)
            .await
            .context(error::FileSnafu)?;
        debug!(target: "store", "stored {key}");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => error::BlobNotFoundSnafu {
                key: key.to_string(),
            }
            .fail(),
            Err(e) => Err(e).context(error::FileSnafu),
        }
    }

    async fn get_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match tokio::fs::File::open(self.path_for(key)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => error::BlobNotFoundSnafu {
                key: key.to_string(),
            }
            .fail(),
            Err(e) => Err(e).context(error::FileSnafu),
        }
    }
}
