//! Range-read extraction: resolve a file index entry to the minimal
//! compressed byte range of its layer, fetch only those bytes, and decode
//! the body with the layer's gzip access index.

use std::path::Path;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::StreamReader;

use crate::registry::Registry;
use crate::tar::Entry;
use crate::{error, gzi, Result};

/// A source of compressed layer bytes addressable by range. `start` is a
/// 0-based byte offset; `end` is inclusive, `None` reads to the end of the
/// blob.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn read_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Ranged reads against a layer blob in an OCI registry
pub struct RegistryRangeSource {
    registry: Registry,
    repository: String,
    layer_digest: String,
}

impl RegistryRangeSource {
    pub fn new(registry: Registry, repository: String, layer_digest: String) -> Self {
        Self {
            registry,
            repository,
            layer_digest,
        }
    }
}

#[async_trait]
impl RangeSource for RegistryRangeSource {
    async fn read_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let stream = self
            .registry
            .fetch_blob_range(&self.repository, &self.layer_digest, start, end)
            .await?;
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}

/// Ranged reads against a compressed layer on the local filesystem, used by
/// the test suite and offline extraction.
pub struct FileRangeSource {
    path: std::path::PathBuf,
}

impl FileRangeSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RangeSource for FileRangeSource {
    async fn read_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .context(error::FileSnafu)?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .context(error::FileSnafu)?;
        match end {
            Some(end) => Ok(Box::new(file.take(end + 1 - start))),
            None => Ok(Box::new(file)),
        }
    }
}

/// Reconstruct the uncompressed body of `entry` by fetching the compressed
/// range its spans cover and decoding through the stored access index at
/// `index_path`.
pub async fn extract_entry(
    source: &dyn RangeSource,
    index_path: &Path,
    spans: &[gzi::Span],
    entry: &Entry,
) -> Result<Vec<u8>> {
    let (first, last) = entry_span_indices(spans, entry)?;
    let (start, end) = gzi::compressed_range(spans, first, last);

    // The access index positions compressed bytes 1-based, hence the -1 when
    // translating to an HTTP byte offset.
    let reader = source.read_range(start - 1, end).await?;
    let body = gzi::extract(reader, index_path, start, entry.offset, entry.hdr.size).await?;

    debug!(
        target: "extract",
        "extracted {} bytes of {} from compressed range {}..{:?}",
        body.len(),
        entry.hdr.name,
        start - 1,
        end,
    );
    Ok(body)
}

/// Find the span-list indices corresponding to the ordinals stored on the
/// entry. A missing ordinal means the stored index artifact no longer
/// matches the file index.
fn entry_span_indices(spans: &[gzi::Span], entry: &Entry) -> Result<(usize, usize)> {
    let position = |number: u32| spans.iter().position(|s| s.number == number);
    match (
        entry.spans.first().copied().and_then(&position),
        entry.spans.last().copied().and_then(&position),
    ) {
        (Some(first), Some(last)) => Ok((first, last)),
        _ => error::OffsetNotIndexedSnafu {
            offset: entry.offset,
        }
        .fail(),
    }
}
