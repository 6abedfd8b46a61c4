//! Read-side resolution against a finalized image: directory listings and
//! file bodies, served from the stored indices plus ranged registry reads.
//! Requests share nothing mutable beyond per-process caches of downloaded
//! gzip indices, which are content-addressed and never invalidated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use snafu::ResultExt;
use tokio::sync::Mutex;

use crate::extract::{extract_entry, RegistryRangeSource};
use crate::merge::MergedEntry;
use crate::meta::ImageKey;
use crate::query::{self, Predicate};
use crate::registry::Registry;
use crate::store::{image_index_key, layer_gzi_key, BlobStore};
use crate::tar::clean_name;
use crate::uri::ImageRef;
use crate::{error, gzi, Result};

/// Browse operations over finalized images. One instance is meant to live
/// for the process: its gzip-index cache is keyed by layer digest and filled
/// at most once per layer.
pub struct Browser {
    store: Arc<dyn BlobStore>,
    cache: tempfile::TempDir,
    gzi_cache: Mutex<HashMap<String, PathBuf>>,
    registries: Mutex<HashMap<String, Registry>>,
}

impl Browser {
    pub fn new(store: Arc<dyn BlobStore>) -> Result<Self> {
        Ok(Self {
            store,
            cache: tempfile::tempdir().context(error::DirectorySnafu)?,
            gzi_cache: Mutex::new(HashMap::new()),
            registries: Mutex::new(HashMap::new()),
        })
    }

    /// List the entries whose parent is `path`. Accepts `/`, `etc`, `/etc/`
    /// and friends; everything canonicalizes to the stored parent form.
    pub async fn list_directory(&self, key: &ImageKey, path: &str) -> Result<Vec<MergedEntry>> {
        let parent = canonical_dir(path);
        let predicate = Predicate::parent(parent)?;
        query::select(
            self.store.as_ref(),
            &image_index_key(&key.repo, &key.digest),
            &predicate,
        )
        .await
    }

    /// Fetch the uncompressed body of the file at `path`, reading only the
    /// compressed range of the contributing layer that covers it.
    pub async fn read_file(&self, image: &ImageRef, path: &str) -> Result<Vec<u8>> {
        let digest = image.digest().ok_or_else(|| error::Error::MalformedUri {
            reason: "reading a file requires a digest-pinned image".to_string(),
        })?;
        let key = ImageKey::new(image.repo(), digest);

        let name = canonical_file(path);
        let predicate = Predicate::name(name.clone())?;
        let entries: Vec<MergedEntry> = query::select(
            self.store.as_ref(),
            &image_index_key(&key.repo, &key.digest),
            &predicate,
        )
        .await?;

        let entry = match entries.len() {
            0 => return error::EntryNotFoundSnafu { path: name }.fail(),
            1 => entries.into_iter().next().unwrap(),
            count => return error::UnexpectedEntryCountSnafu { path: name, count }.fail(),
        };

        let index_path = self.layer_index(&entry.layer).await?;
        let spans = gzi::list_spans(&index_path).await?;

        let registry = self.registry_for(image).await?;
        let source = RegistryRangeSource::new(
            registry,
            image.repository().clone(),
            entry.layer.clone(),
        );
        extract_entry(&source, &index_path, &spans, &entry.entry).await
    }

    /// Download a layer's gzip access index into the process-local cache,
    /// at most once per digest. Layer blobs are content-addressed, so a
    /// cached index never goes stale.
    async fn layer_index(&self, layer_digest: &str) -> Result<PathBuf> {
        if let Some(path) = self.gzi_cache.lock().await.get(layer_digest) {
            return Ok(path.clone());
        }

        let bytes = self.store.get(&layer_gzi_key(layer_digest)).await?;
        let path = self
            .cache
            .path()
            .join(format!("{}.gzi", layer_digest.replace('/', "_")));
        tokio::fs::write(&path, &bytes)
            .await
            .context(error::FileSnafu)?;
        debug!(target: "browse", "cached gzip index for {layer_digest}");

        let mut cached = self.gzi_cache.lock().await;
        Ok(cached
            .entry(layer_digest.to_string())
            .or_insert(path)
            .clone())
    }

    async fn registry_for(&self, image: &ImageRef) -> Result<Registry> {
        let base = image.registry().base().clone();
        if let Some(registry) = self.registries.lock().await.get(&base) {
            return Ok(registry.clone());
        }
        let registry = Registry::new(image.registry()).await?;
        let mut cached = self.registries.lock().await;
        Ok(cached.entry(base).or_insert(registry).clone())
    }
}

/// Canonicalize a directory path to the stored `Parent` form: `/` for the
/// root, otherwise the cleaned path with a trailing slash.
fn canonical_dir(path: &str) -> String {
    let cleaned = clean_name(path.trim_start_matches('/'));
    if cleaned == "." {
        "/".to_string()
    } else {
        format!("{cleaned}/")
    }
}

/// Canonicalize a file path to the stored `Hdr.Name` form
fn canonical_file(path: &str) -> String {
    clean_name(path.trim_start_matches('/'))
}
