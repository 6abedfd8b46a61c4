//! Per-image orchestration: resolve the manifest, record job metadata, index
//! every layer in parallel, merge the results, and finalize the job row
//! exactly once.

use std::sync::Arc;

use futures::future::join_all;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::job::JobLifecycle;
use crate::meta::{ImageKey, LayerProgress, LayerProgressKey, MetadataStore, Status};
use crate::models::{Compression, Descriptor, ImageManifest, ManifestIndex, MediaType, Platform};
use crate::progress::{spawn_reporter, Counters};
use crate::registry::Registry;
use crate::store::{layer_files_key, layer_gzi_key, BlobStore};
use crate::uri::ImageRef;
use crate::{error, indexer, merge, Result};

/// Summary of a completed ingest
#[derive(Debug)]
pub struct IngestReport {
    pub key: ImageKey,
    pub execution_id: String,
    pub layers: usize,
    pub entries: usize,
    pub total_size: u64,
}

pub struct Ingestor {
    store: Arc<dyn BlobStore>,
    meta: Arc<dyn MetadataStore>,
    /// Override for checkpoint spacing (MiB); tests use small spans
    pub span_mib: Option<u32>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn BlobStore>, meta: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            meta,
            span_mib: None,
        }
    }

    /// Ingest a digest-pinned image end to end. A `Conflict` from job
    /// creation means another worker already owns this image; callers
    /// surface the existing job's status instead.
    pub async fn run(&self, image: &ImageRef, cancel: &CancellationToken) -> Result<IngestReport> {
        let digest = image.digest().ok_or_else(|| error::Error::MalformedUri {
            reason: "ingest requires a digest-pinned image".to_string(),
        })?;
        let key = ImageKey::new(image.repo(), digest);

        let jobs = JobLifecycle::new(self.meta.clone());
        let tags = image.tag().cloned().into_iter().collect();
        let item = jobs.create(&key, tags).await?;
        jobs.start(&key, &item.execution_id).await?;

        let outcome = self.index_image(image, &key, cancel).await;
        let status = match &outcome {
            Ok(_) => Status::Succeeded,
            Err(_) => Status::Failed,
        };
        if let Err(e) = jobs
            .finalize(&key, &item.execution_id, item.retrieved, status)
            .await
        {
            warn!(target: "ingest", "failed to finalize job row: {e}");
        }

        let (layers, entries, total_size) = outcome?;
        Ok(IngestReport {
            key,
            execution_id: item.execution_id,
            layers,
            entries,
            total_size,
        })
    }

    async fn index_image(
        &self,
        image: &ImageRef,
        key: &ImageKey,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize, u64)> {
        let registry = Registry::new(image.registry()).await?;
        let repository = image.repository().clone();

        let (manifest_bytes, _) = registry
            .fetch_manifest_raw(&repository, &key.digest)
            .await?;
        let manifest: ImageManifest =
            serde_json::from_slice(manifest_bytes.as_ref()).context(error::BodyDeserializeSnafu)?;

        for layer in manifest.layers.iter() {
            if layer.media_type.compression() != Compression::Gzip {
                return error::UnsupportedLayerCompressionSnafu {
                    media_type: media_type_string(&layer.media_type),
                }
                .fail();
            }
        }

        let raw_config = registry
            .fetch_blob_bytes(&repository, &manifest.config.digest)
            .await?;
        let total_size: u64 = manifest.layers.iter().map(|l| l.size).sum();
        self.meta
            .set_image_details(
                key,
                total_size,
                manifest_bytes.to_vec(),
                raw_config.to_vec(),
            )
            .await?;

        // One indexing task per layer; the merger waits on all of them in
        // manifest order.
        let mut tasks: Vec<JoinHandle<Result<String>>> = Vec::new();
        for layer in manifest.layers.iter() {
            let layer = layer.clone();
            let registry = registry.clone();
            let store = self.store.clone();
            let meta = self.meta.clone();
            let repository = repository.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            let span_mib = self.span_mib;
            tasks.push(tokio::spawn(async move {
                index_one_layer(registry, store, meta, repository, key, layer, cancel, span_mib)
                    .await
            }));
        }

        let mut layer_digests = Vec::new();
        let mut first_error = None;
        for result in join_all(tasks).await {
            match result.context(error::TaskJoinSnafu)? {
                Ok(digest) => layer_digests.push(digest),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let entries = merge::merge_layers(self.store.as_ref(), key, &layer_digests).await?;
        Ok((layer_digests.len(), entries, total_size))
    }
}

/// Stream one layer once: progress row, reporter, indexing pass, final
/// progress flush, then artifact upload. Nothing is uploaded on failure or
/// cancellation; the staging directory vanishes with this function.
#[allow(clippy::too_many_arguments)]
async fn index_one_layer(
    registry: Registry,
    store: Arc<dyn BlobStore>,
    meta: Arc<dyn MetadataStore>,
    repository: String,
    key: ImageKey,
    layer: Descriptor,
    cancel: CancellationToken,
    span_mib: Option<u32>,
) -> Result<String> {
    let progress_key = LayerProgressKey {
        repo: key.repo.clone(),
        image_digest: key.digest.clone(),
        layer_digest: layer.digest.clone(),
    };
    meta.put_layer_progress(&LayerProgress::new(progress_key.clone(), layer.size))
        .await?;

    let counters = Counters::new();
    let reporter_token = CancellationToken::new();
    let reporter = spawn_reporter(
        meta.clone(),
        progress_key,
        counters.clone(),
        reporter_token.clone(),
    );

    let workdir = tempfile::tempdir().context(error::DirectorySnafu)?;
    let outcome = async {
        let (stream, _) = open_blob_with_retry(&registry, &repository, &layer.digest).await?;
        let compressed = StreamReader::new(Box::pin(stream));
        indexer::index_layer(compressed, workdir.path(), &counters, &cancel, span_mib).await
    }
    .await;

    // The reporter's final write lands before anything else happens, so the
    // stored counters always match the last observed values.
    reporter_token.cancel();
    let _ = reporter.await;

    let artifacts = outcome?;
    store
        .put_file(&layer_gzi_key(&layer.digest), &artifacts.gzi_path)
        .await?;
    store
        .put_file(&layer_files_key(&layer.digest), &artifacts.files_path)
        .await?;
    info!(
        target: "ingest",
        "layer {} indexed: {} entries",
        layer.digest,
        artifacts.entries.len(),
    );
    Ok(layer.digest)
}

const BLOB_OPEN_ATTEMPTS: u32 = 3;

/// Open a layer blob stream, retrying transient request failures with
/// exponential backoff. Once the stream is open there is no mid-stream
/// resume; a broken stream fails the layer task.
async fn open_blob_with_retry(
    registry: &Registry,
    repository: &str,
    digest: &str,
) -> Result<(
    impl futures::Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>>,
    u64,
)> {
    let mut attempt = 0;
    loop {
        match registry.fetch_blob(repository, digest).await {
            Ok(opened) => return Ok(opened),
            Err(e @ error::Error::Request { .. }) if attempt + 1 < BLOB_OPEN_ATTEMPTS => {
                attempt += 1;
                let backoff = std::time::Duration::from_millis(500 * (1 << attempt));
                warn!(
                    target: "ingest",
                    "blob open attempt {attempt} for {digest} failed ({e}), retrying in {backoff:?}",
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolve a tag reference to a digest-pinned one, picking a platform from
/// the manifest index when the registry serves one. A single-manifest
/// response is the image itself: its digest is the hash of the body.
pub async fn resolve(image: &ImageRef, platform: Option<Platform>) -> Result<ImageRef> {
    if image.digest().is_some() {
        return Ok(image.clone());
    }

    let registry = Registry::new(image.registry()).await?;
    let reference = image.reference().to_string();
    let (bytes, content_type) = registry
        .fetch_manifest_raw(image.repository(), &reference)
        .await?;

    let is_index = match content_type.as_deref() {
        Some("application/vnd.oci.image.index.v1+json")
        | Some("application/vnd.docker.distribution.manifest.list.v2+json") => true,
        Some(_) => false,
        // No content type: sniff the body shape
        None => serde_json::from_slice::<serde_json::Value>(bytes.as_ref())
            .ok()
            .map(|v| v.get("manifests").is_some())
            .unwrap_or(false),
    };

    if !is_index {
        let hash = Sha256::digest(bytes.as_ref());
        let digest = format!("sha256:{}", base16::encode_lower(hash.as_slice()));
        return image.clone().with_digest(&digest);
    }

    let index: ManifestIndex =
        serde_json::from_slice(bytes.as_ref()).context(error::BodyDeserializeSnafu)?;

    if let Some(platform) = platform {
        let chosen = index
            .manifests
            .iter()
            .find(|m| platform_matches(m.platform.as_ref(), &platform))
            .ok_or_else(|| error::Error::IndexNoPlatform {
                platform: platform.to_string(),
            })?;
        return image.clone().with_digest(&chosen.digest);
    }

    // Prefer the platform of the running environment, fall back to the
    // first listed manifest
    let current = Platform::default();
    let chosen = index
        .manifests
        .iter()
        .find(|m| platform_matches(m.platform.as_ref(), &current))
        .or_else(|| index.manifests.first())
        .ok_or_else(|| error::Error::IndexNoPlatform {
            platform: current.to_string(),
        })?;
    image.clone().with_digest(&chosen.digest)
}

fn platform_matches(candidate: Option<&Platform>, target: &Platform) -> bool {
    candidate.is_some_and(|c| {
        c.os == target.os
            && c.architecture == target.architecture
            && (target.variant.is_none() || c.variant == target.variant)
    })
}

fn media_type_string(media_type: &MediaType) -> String {
    serde_json::to_string(media_type)
        .map(|s| s.trim_matches('"').to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_platform_matching() {
        let target = Platform {
            os: "linux".to_string(),
            architecture: "arm64".to_string(),
            variant: None,
        };
        let candidate = Platform {
            os: "linux".to_string(),
            architecture: "arm64".to_string(),
            variant: Some("v8".to_string()),
        };
        assert!(platform_matches(Some(&candidate), &target));
        assert!(!platform_matches(None, &target));

        let pinned = Platform {
            variant: Some("v7".to_string()),
            ..target.clone()
        };
        assert!(!platform_matches(Some(&candidate), &pinned));
    }

    #[test]
    fn test_media_type_string() {
        assert_eq!(
            media_type_string(&MediaType::Layer(Compression::Zstd)),
            "application/vnd.oci.image.layer.v1.tar.zst"
        );
    }
}
