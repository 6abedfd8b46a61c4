//! The metadata store seam: one item per image job plus one progress item
//! per in-flight layer, keyed by the composite `pk`/`sk` scheme the browse
//! surface polls. Conditional writes carry the job lifecycle; there are no
//! locks anywhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::{error, Result};

/// Rows expire 90 days after they were written
const TTL_DAYS: i64 = 90;

/// Identifies one image: repository reference (including registry host) plus
/// the content-addressed manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageKey {
    pub repo: String,
    pub digest: String,
}

impl ImageKey {
    pub fn new(repo: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            digest: digest.into(),
        }
    }

    pub fn pk(&self) -> String {
        format!("image#{}", self.repo)
    }

    pub fn sk(&self) -> String {
        format!("digest#{}", self.digest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// The per-image job row
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into))]
#[serde(rename_all = "PascalCase")]
pub struct ImageInfoItem {
    #[serde(flatten)]
    pub key: ImageKey,
    #[builder(default)]
    #[serde(default)]
    pub tags: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub total_size: u64,
    /// Wall-clock duration of the finished job, in milliseconds
    #[builder(default)]
    #[serde(default)]
    pub duration: u64,
    pub retrieved: DateTime<Utc>,
    pub execution_id: String,
    pub status: Status,
    /// Raw manifest bytes as returned by the registry
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Vec<u8>>,
    /// Raw image config bytes as returned by the registry
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_config: Option<Vec<u8>>,
    #[builder(default = "ttl_epoch()")]
    #[serde(rename = "ttl", default)]
    pub ttl: i64,
    #[builder(default = "1")]
    #[serde(rename = "v", default)]
    pub v: u32,
}

impl ImageInfoItem {
    /// Rough indexing duration estimate surfaced while a job is in flight
    pub fn estimate_seconds(&self) -> u64 {
        2 + self.total_size / 25_000_000
    }
}

/// Identifies one layer's progress row within an image job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerProgressKey {
    pub repo: String,
    pub image_digest: String,
    pub layer_digest: String,
}

impl LayerProgressKey {
    pub fn pk(&self) -> String {
        format!("image#{}", self.repo)
    }

    pub fn sk(&self) -> String {
        format!("digest#{}#layer#{}", self.image_digest, self.layer_digest)
    }
}

/// Live byte/file counters for one layer while it indexes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerProgress {
    #[serde(flatten)]
    pub key: LayerProgressKey,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub completed_bytes: u64,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub completed_files: u64,
    #[serde(rename = "ttl", default)]
    pub ttl: i64,
    #[serde(rename = "v", default)]
    pub v: u32,
}

impl LayerProgress {
    pub fn new(key: LayerProgressKey, total_bytes: u64) -> Self {
        Self {
            key,
            total_bytes,
            completed_bytes: 0,
            total_files: 0,
            completed_files: 0,
            ttl: ttl_epoch(),
            v: 1,
        }
    }
}

pub(crate) fn ttl_epoch() -> i64 {
    (Utc::now() + chrono::Duration::days(TTL_DAYS)).timestamp()
}

/// Key-value metadata storage with optimistic conditional writes. `Conflict`
/// results are part of the contract: the job lifecycle uses them to detect
/// concurrent orchestrators.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Conditional insert; fails with `Conflict` if the image row exists
    async fn create_image(&self, item: &ImageInfoItem) -> Result<()>;
    /// Conditional update to RUNNING; fails with `Conflict` unless the row
    /// exists and carries the given execution id
    async fn set_image_running(&self, key: &ImageKey, execution_id: &str) -> Result<()>;
    /// Unconditional terminal update of status, duration and execution id
    async fn finalize_image(
        &self,
        key: &ImageKey,
        status: Status,
        duration_ms: u64,
        execution_id: &str,
    ) -> Result<()>;
    /// Record manifest, raw config and total compressed size on the row
    async fn set_image_details(
        &self,
        key: &ImageKey,
        total_size: u64,
        manifest: Vec<u8>,
        raw_config: Vec<u8>,
    ) -> Result<()>;
    async fn get_image(&self, key: &ImageKey) -> Result<Option<ImageInfoItem>>;
    /// Create (or reset) a layer progress row with known totals
    async fn put_layer_progress(&self, progress: &LayerProgress) -> Result<()>;
    /// Upsert the live counters on a progress row
    async fn update_layer_progress(
        &self,
        key: &LayerProgressKey,
        completed_bytes: u64,
        completed_files: u64,
    ) -> Result<()>;
    /// All layer progress rows for an image
    async fn list_layer_progress(&self, key: &ImageKey) -> Result<Vec<LayerProgress>>;
}

/// Metadata store over a local directory: one JSON file per row, with
/// `create_new` providing the conditional-insert semantics. Serves the CLI's
/// local mode and the test suite.
#[derive(Debug, Clone)]
pub struct FsMetadataStore {
    root: PathBuf,
}

impl FsMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn item_path(&self, pk: &str, sk: &str) -> PathBuf {
        self.root.join(sanitize(pk)).join(sanitize(sk))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context(error::BodyDeserializeSnafu)?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(error::FileSnafu),
        }
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::DirectorySnafu)?;
        }
        let bytes = serde_json::to_vec_pretty(value).context(error::SerializeSnafu)?;
        tokio::fs::write(path, bytes).await.context(error::FileSnafu)
    }
}

/// Keys hold `/` (repositories) and `:` (digests); flatten them for use as
/// file names.
fn sanitize(part: &str) -> String {
    part.replace('/', "_")
}

#[async_trait]
impl MetadataStore for FsMetadataStore {
    async fn create_image(&self, item: &ImageInfoItem) -> Result<()> {
        let path = self.item_path(&item.key.pk(), &item.key.sk());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::DirectorySnafu)?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return error::ConflictSnafu {
                    reason: format!("image row already exists for {}", item.key.sk()),
                }
                .fail()
            }
            Err(e) => return Err(e).context(error::FileSnafu),
        };
        let bytes = serde_json::to_vec_pretty(item).context(error::SerializeSnafu)?;
        file.write_all(&bytes).await.context(error::FileSnafu)?;
        Ok(())
    }

    async fn set_image_running(&self, key: &ImageKey, execution_id: &str) -> Result<()> {
        let path = self.item_path(&key.pk(), &key.sk());
        let Some(mut item) = Self::read_json::<ImageInfoItem>(&path).await? else {
            return error::ConflictSnafu {
                reason: format!("no image row for {}", key.sk()),
            }
            .fail();
        };
        if item.execution_id != execution_id {
            return error::ConflictSnafu {
                reason: format!(
                    "image row for {} is owned by execution {}",
                    key.sk(),
                    item.execution_id
                ),
            }
            .fail();
        }
        item.status = Status::Running;
        Self::write_json(&path, &item).await
    }

    async fn finalize_image(
        &self,
        key: &ImageKey,
        status: Status,
        duration_ms: u64,
        execution_id: &str,
    ) -> Result<()> {
        let path = self.item_path(&key.pk(), &key.sk());
        let Some(mut item) = Self::read_json::<ImageInfoItem>(&path).await? else {
            return error::ConflictSnafu {
                reason: format!("no image row for {}", key.sk()),
            }
            .fail();
        };
        item.status = status;
        item.duration = duration_ms;
        item.execution_id = execution_id.to_string();
        Self::write_json(&path, &item).await
    }

    async fn set_image_details(
        &self,
        key: &ImageKey,
        total_size: u64,
        manifest: Vec<u8>,
        raw_config: Vec<u8>,
    ) -> Result<()> {
        let path = self.item_path(&key.pk(), &key.sk());
        let Some(mut item) = Self::read_json::<ImageInfoItem>(&path).await? else {
            return error::ConflictSnafu {
                reason: format!("no image row for {}", key.sk()),
            }
            .fail();
        };
        item.total_size = total_size;
        item.manifest = Some(manifest);
        item.raw_config = Some(raw_config);
        Self::write_json(&path, &item).await
    }

    async fn get_image(&self, key: &ImageKey) -> Result<Option<ImageInfoItem>> {
        Self::read_json(&self.item_path(&key.pk(), &key.sk())).await
    }

    async fn put_layer_progress(&self, progress: &LayerProgress) -> Result<()> {
        let path = self.item_path(&progress.key.pk(), &progress.key.sk());
        Self::write_json(&path, progress).await
    }

    async fn update_layer_progress(
        &self,
        key: &LayerProgressKey,
        completed_bytes: u64,
        completed_files: u64,
    ) -> Result<()> {
        let path = self.item_path(&key.pk(), &key.sk());
        let mut progress = Self::read_json::<LayerProgress>(&path)
            .await?
            .unwrap_or_else(|| LayerProgress::new(key.clone(), 0));
        progress.completed_bytes = completed_bytes;
        progress.completed_files = completed_files;
        Self::write_json(&path, &progress).await
    }

    async fn list_layer_progress(&self, key: &ImageKey) -> Result<Vec<LayerProgress>> {
        let dir = self.root.join(sanitize(&key.pk()));
        let prefix = sanitize(&format!("digest#{}#layer#", key.digest));
        let mut progresses = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(progresses),
            Err(e) => return Err(e).context(error::DirectorySnafu),
        };
        while let Some(entry) = entries.next_entry().await.context(error::DirectorySnafu)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) {
                if let Some(progress) = Self::read_json::<LayerProgress>(&entry.path()).await? {
                    progresses.push(progress);
                }
            }
        }
        progresses.sort_by(|a, b| a.key.layer_digest.cmp(&b.key.layer_digest));
        Ok(progresses)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(key: &ImageKey, execution_id: &str) -> ImageInfoItem {
        ImageInfoItemBuilder::default()
            .key(key.clone())
            .retrieved(Utc::now())
            .execution_id(execution_id)
            .status(Status::Pending)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_is_conditional() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMetadataStore::new(dir.path());
        let key = ImageKey::new("example.com/app", "sha256:abc");

        store.create_image(&item(&key, "exec-1")).await.unwrap();
        let second = store.create_image(&item(&key, "exec-2")).await;
        assert!(matches!(second, Err(crate::error::Error::Conflict { .. })));

        // The original owner still holds the row
        let stored = store.get_image(&key).await.unwrap().unwrap();
        assert_eq!(stored.execution_id, "exec-1");
        assert_eq!(stored.v, 1);
    }

    #[tokio::test]
    async fn test_start_requires_matching_execution() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMetadataStore::new(dir.path());
        let key = ImageKey::new("example.com/app", "sha256:abc");
        store.create_image(&item(&key, "exec-1")).await.unwrap();

        let foreign = store.set_image_running(&key, "exec-2").await;
        assert!(matches!(foreign, Err(crate::error::Error::Conflict { .. })));

        store.set_image_running(&key, "exec-1").await.unwrap();
        let stored = store.get_image(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Running);
    }

    #[tokio::test]
    async fn test_finalize_and_details() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMetadataStore::new(dir.path());
        let key = ImageKey::new("example.com/app", "sha256:abc");
        store.create_image(&item(&key, "exec-1")).await.unwrap();

        store
            .set_image_details(&key, 123456, b"{}".to_vec(), b"{}".to_vec())
            .await
            .unwrap();
        store
            .finalize_image(&key, Status::Succeeded, 4200, "exec-1")
            .await
            .unwrap();

        let stored = store.get_image(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Succeeded);
        assert_eq!(stored.duration, 4200);
        assert_eq!(stored.total_size, 123456);
        assert!(stored.manifest.is_some());
    }

    #[tokio::test]
    async fn test_layer_progress_rollup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMetadataStore::new(dir.path());
        let progress_key = LayerProgressKey {
            repo: "example.com/app".to_string(),
            image_digest: "sha256:abc".to_string(),
            layer_digest: "sha256:layer1".to_string(),
        };

        store
            .put_layer_progress(&LayerProgress::new(progress_key.clone(), 1000))
            .await
            .unwrap();
        store
            .update_layer_progress(&progress_key, 512, 3)
            .await
            .unwrap();

        let image_key = ImageKey::new("example.com/app", "sha256:abc");
        let listed = store.list_layer_progress(&image_key).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].total_bytes, 1000);
        assert_eq!(listed[0].completed_bytes, 512);
        assert_eq!(listed[0].completed_files, 3);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&Status::Succeeded).unwrap(),
            "\"SUCCEEDED\""
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"PENDING\"").unwrap(),
            Status::Pending
        );
    }
}
