//! Single-pass layer indexing: the compressed layer streams once through the
//! gzip index builder while the decompressed side is scanned as a tar
//! stream. The network paces everything; nothing is buffered beyond the
//! pipes between the pieces.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_tar::Archive;
use tokio_util::sync::CancellationToken;

use crate::progress::Counters;
use crate::tar::{depth_key, normalize, CountingReader, Entry, TarHeader};
use crate::{error, gzi, Result};

/// Give up on a layer when this many unreadable headers arrive in a row;
/// isolated checksum failures are skipped and counted.
const MAX_CONSECUTIVE_BAD_HEADERS: u32 = 8;

/// The two staged artifacts of one indexing pass plus scan statistics.
/// Nothing is uploaded until the full pass succeeded.
#[derive(Debug)]
pub struct IndexArtifacts {
    /// File index rows, ordered by path depth then lexicographically
    pub entries: Vec<Entry>,
    /// Staged gzip access index (`index.gzi`)
    pub gzi_path: PathBuf,
    /// Staged gzipped NDJSON file index (`files.json.gz`)
    pub files_path: PathBuf,
    /// Headers skipped due to checksum failures
    pub bad_headers: u64,
}

/// Stream one compressed layer to completion, producing the gzip access
/// index and the per-entry file index under `workdir`. The byte counter
/// advances with every network read and the file counter with every tar
/// member surfaced, for the progress reporter to sample.
pub async fn index_layer<R>(
    compressed: R,
    workdir: &Path,
    counters: &Counters,
    cancel: &CancellationToken,
    span_mib: Option<u32>,
) -> Result<IndexArtifacts>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let gzi_path = workdir.join("index.gzi");
    let files_path = workdir.join("files.json.gz");

    let mut process = gzi::IndexerProcess::spawn(&gzi_path, span_mib)?;
    let stdin = process.take_stdin().expect("stdin was piped");
    let stdout = process.take_stdout().expect("stdout was piped");

    // Network side: compressed bytes flow through the byte counter into the
    // index builder.
    let mut network = CountingReader::new(compressed, counters.bytes.clone());
    let pump = tokio::spawn(async move {
        let mut stdin = stdin;
        let result = tokio::io::copy(&mut network, &mut stdin).await;
        drop(stdin);
        result
    });

    // Decompressed side: the tar scan observes body offsets through the
    // offset counter wrapped around the builder's output.
    let offset = Arc::new(AtomicU64::new(0));
    let mut decompressed = CountingReader::new(stdout, offset.clone());

    let mut rows: Vec<Entry> = Vec::new();
    let mut bad_headers = 0u64;
    let mut consecutive_bad = 0u32;

    {
        let mut archive = Archive::new(&mut decompressed);
        let mut members = archive.entries().context(error::ArchiveSnafu)?;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    process.abort().await;
                    pump.abort();
                    return error::CancelledSnafu.fail();
                }
                next = members.next() => next,
            };
            let Some(member) = next else { break };
            let mut member = match member {
                Ok(member) => member,
                Err(e) => {
                    bad_headers += 1;
                    consecutive_bad += 1;
                    warn!(target: "indexer", "skipping unreadable tar header: {e}");
                    if consecutive_bad >= MAX_CONSECUTIVE_BAD_HEADERS {
                        process.abort().await;
                        pump.abort();
                        return error::CorruptStreamSnafu {
                            reason: format!(
                                "{consecutive_bad} consecutive unreadable tar headers",
                            ),
                        }
                        .fail();
                    }
                    continue;
                }
            };
            consecutive_bad = 0;

            // The scan consumed exactly through the member's header blocks,
            // so the counter now reads the body offset.
            let body_offset = offset.load(Ordering::Relaxed);

            let mut pax = std::collections::BTreeMap::new();
            if let Ok(Some(extensions)) = member.pax_extensions().await {
                for extension in extensions {
                    let Ok(extension) = extension else { continue };
                    if let (Ok(key), Ok(value)) = (extension.key(), extension.value()) {
                        pax.insert(key.to_string(), value.to_string());
                    }
                }
            }

            let raw_name = member
                .path()
                .context(error::ArchiveSnafu)?
                .to_string_lossy()
                .to_string();
            let header = member.header();
            let entry_type = header.entry_type();
            let (name, parent) = normalize(raw_name.as_str(), entry_type.is_dir());

            let hdr = TarHeader {
                name,
                type_flag: entry_type.as_byte(),
                linkname: member
                    .link_name()
                    .context(error::ArchiveSnafu)?
                    .map(|p| p.to_string_lossy().to_string())
                    .filter(|l| !l.is_empty()),
                size: member.header().size().context(error::ArchiveSnafu)?,
                mode: member.header().mode().context(error::ArchiveSnafu)?,
                uid: member.header().uid().context(error::ArchiveSnafu)?,
                gid: member.header().gid().context(error::ArchiveSnafu)?,
                uname: member
                    .header()
                    .username()
                    .ok()
                    .flatten()
                    .filter(|u| !u.is_empty())
                    .map(|u| u.to_string()),
                gname: member
                    .header()
                    .groupname()
                    .ok()
                    .flatten()
                    .filter(|g| !g.is_empty())
                    .map(|g| g.to_string()),
                mod_time: chrono::DateTime::from_timestamp(
                    member.header().mtime().context(error::ArchiveSnafu)? as i64,
                    0,
                )
                .unwrap_or_default(),
                pax,
            };

            rows.push(Entry {
                offset: body_offset,
                spans: Vec::new(),
                hdr,
                parent,
            });
            counters.files.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Drain the blocking-factor padding after the end-of-archive marker so
    // the index builder sees the whole stream and can exit.
    tokio::io::copy(&mut decompressed, &mut tokio::io::sink())
        .await
        .context(error::ArchiveSnafu)?;

    match pump.await.context(error::TaskJoinSnafu)? {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            // The builder died mid-stream; wait() below reports why
        }
        Err(e) => {
            process.abort().await;
            return error::CorruptStreamSnafu {
                reason: format!("layer stream failed: {e}"),
            }
            .fail();
        }
    }
    process.wait().await?;

    let spans = gzi::list_spans(&gzi_path).await?;
    for row in rows.iter_mut() {
        let (first, last) = gzi::span_range(&spans, row.offset, row.hdr.size)?;
        row.spans = gzi::span_numbers(&spans, first, last);
    }

    rows.sort_by_cached_key(|row| depth_key(&row.hdr.name));

    let file = tokio::fs::File::create(&files_path)
        .await
        .context(error::FileSnafu)?;
    let mut encoder = async_compression::tokio::write::GzipEncoder::new(file);
    for row in &rows {
        let line = serde_json::to_vec(row).context(error::SerializeSnafu)?;
        encoder.write_all(&line).await.context(error::FileSnafu)?;
        encoder.write_all(b"\n").await.context(error::FileSnafu)?;
    }
    encoder.shutdown().await.context(error::FileSnafu)?;

    info!(
        target: "indexer",
        "indexed {} entries across {} spans ({} bad headers)",
        rows.len(),
        spans.len(),
        bad_headers,
    );

    Ok(IndexArtifacts {
        entries: rows,
        gzi_path,
        files_path,
        bad_headers,
    })
}
