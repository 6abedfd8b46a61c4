//! Tar-side models for the layer file index: the per-entry row schema, the
//! offset-tracking reader adapter the indexer wraps around decompressed
//! streams, and path canonicalization shared by the indexer and the browse
//! resolver.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};

/// One row of a layer file index. Serialized as a single line of
/// newline-delimited JSON inside `files.json.gz`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Entry {
    /// Uncompressed byte offset of the file body, immediately after the
    /// 512-byte tar header block
    pub offset: u64,
    /// Ordinals of the checkpoints needed to decode the body, sorted
    #[serde(default)]
    pub spans: Vec<u32>,
    pub hdr: TarHeader,
    /// Canonical parent directory: `/` for top-level entries, otherwise the
    /// cleaned parent path with a trailing slash
    pub parent: String,
}

/// The retained portion of a tar header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TarHeader {
    pub name: String,
    #[serde(rename = "Type")]
    pub type_flag: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkname: Option<String>,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gname: Option<String>,
    pub mod_time: DateTime<Utc>,
    #[serde(rename = "PAX", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pax: BTreeMap<String, String>,
}

/// A reader adapter that advances an externally visible counter by exactly
/// the number of bytes consumed. The indexer uses one around the network
/// stream (progress bytes) and one around the decompressed stream (tar body
/// offsets); readers of the counter use relaxed loads.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let consumed = buf.filled().len() - before;
                this.count.fetch_add(consumed as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Clean a slash-separated tar member name: drop empty and `.` segments,
/// resolve `..` structurally (symlinks are never followed during indexing).
pub(crate) fn clean_name(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            // symlinks are never followed during indexing, so `..` resolves
            // structurally; climbing past the root drops the segment
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Canonicalize a raw tar member name into the stored `(name, parent)` pair.
/// The archive root becomes `/`; directories other than the root carry a
/// trailing slash; the parent of a top-level entry is `/`.
pub(crate) fn normalize(raw_name: &str, is_dir: bool) -> (String, String) {
    let mut name = clean_name(raw_name);
    if name == "." {
        name = "/".to_string();
    }

    let parent = if name == "/" {
        "/".to_string()
    } else {
        match name.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/"),
            None => "/".to_string(),
        }
    };

    if name != "/" && is_dir {
        name.push('/');
    }

    (name, parent)
}

/// Ordering key for the file index: path depth ascending, then lexicographic
/// within a depth. Partial scans over a directory prefix stay bounded.
pub(crate) fn depth_key(name: &str) -> (usize, String) {
    let trimmed = name.trim_end_matches('/');
    (trimmed.split('/').count(), trimmed.to_string())
}
