//! Flattens ordered per-layer file indices into one image index, applying
//! OCI whiteout semantics. Span references are left untouched: they keep
//! pointing into the contributing layer's gzip access index.

use std::collections::BTreeMap;

use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::meta::ImageKey;
use crate::store::{image_index_key, layer_files_key, BlobStore};
use crate::tar::Entry;
use crate::{error, Result};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// A file index row annotated with the digest of the layer that contributed
/// it. One line of `images/{repo}/{digest}/index.json.gz`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct MergedEntry {
    #[serde(flatten)]
    pub entry: Entry,
    /// Digest of the contributing layer
    pub layer: String,
}

/// Map value while merging: the entry plus the ordinal of its layer, so
/// whiteouts can be gated on "introduced by a strictly earlier layer".
#[derive(Debug, Clone)]
struct Contributed {
    entry: Entry,
    layer: String,
    ordinal: usize,
}

/// Apply one layer's entries (in stream order) onto the path-keyed mapping.
/// Whiteout markers delete by full target path and never survive into the
/// mapping themselves.
fn apply_layer(
    map: &mut BTreeMap<String, Contributed>,
    entries: Vec<Entry>,
    layer_digest: &str,
    ordinal: usize,
) {
    for entry in entries {
        let name = entry.hdr.name.clone();
        let base = name.rsplit_once('/').map(|(_, b)| b).unwrap_or(&name);

        if base == WHITEOUT_OPAQUE_DIR {
            // Everything under the containing directory from earlier layers
            // goes away; the directory entry itself and anything this layer
            // contributed stay.
            let dir = name
                .strip_suffix(WHITEOUT_OPAQUE_DIR)
                .unwrap_or("")
                .to_string();
            let doomed: Vec<String> = map
                .iter()
                .filter(|(path, contributed)| {
                    path.as_str() != dir
                        && path.starts_with(&dir)
                        && contributed.ordinal < ordinal
                })
                .map(|(path, _)| path.clone())
                .collect();
            for path in doomed {
                debug!(target: "merge", "opaque whiteout removing {path}");
                map.remove(&path);
            }
        } else if let Some(target) = base.strip_prefix(WHITEOUT_PREFIX) {
            // `.wh.X` removes X from earlier layers. Directory entries are
            // keyed with a trailing slash, so both forms are candidates.
            let target = format!("{}{}", entry.parent.trim_start_matches('/'), target);
            for candidate in [target.clone(), format!("{target}/")] {
                if map
                    .get(&candidate)
                    .is_some_and(|contributed| contributed.ordinal < ordinal)
                {
                    debug!(target: "merge", "whiteout removing {candidate}");
                    map.remove(&candidate);
                }
            }
        } else {
            map.insert(
                name,
                Contributed {
                    entry,
                    layer: layer_digest.to_string(),
                    ordinal,
                },
            );
        }
    }
}

/// Read one layer's file index rows from the object store, in stored order.
async fn read_layer_index(store: &dyn BlobStore, layer_digest: &str) -> Result<Vec<Entry>> {
    let reader = store.get_reader(&layer_files_key(layer_digest)).await?;
    let decoder = GzipDecoder::new(BufReader::new(reader));
    let mut lines = BufReader::new(decoder).lines();

    let mut entries = Vec::new();
    while let Some(line) = lines.next_line().await.context(error::ArchiveSnafu)? {
        if line.is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line).context(error::IndexEntryDeserializeSnafu)?);
    }
    Ok(entries)
}

/// Merge the file indices of `layers` (manifest order, oldest first) into
/// the flattened image index and store it. Returns the number of surviving
/// entries.
pub async fn merge_layers(
    store: &dyn BlobStore,
    key: &ImageKey,
    layers: &[String],
) -> Result<usize> {
    let mut map: BTreeMap<String, Contributed> = BTreeMap::new();

    for (ordinal, layer_digest) in layers.iter().enumerate() {
        let entries = read_layer_index(store, layer_digest).await?;
        debug!(
            target: "merge",
            "applying layer {layer_digest} with {} entries",
            entries.len(),
        );
        apply_layer(&mut map, entries, layer_digest, ordinal);
    }

    // BTreeMap iteration is already lexicographic by full path
    let mut encoder = async_compression::tokio::write::GzipEncoder::new(Vec::new());
    let count = map.len();
    for (_, contributed) in map {
        let merged = MergedEntry {
            entry: contributed.entry,
            layer: contributed.layer,
        };
        let line = serde_json::to_vec(&merged).context(error::SerializeSnafu)?;
        encoder.write_all(&line).await.context(error::FileSnafu)?;
        encoder.write_all(b"\n").await.context(error::FileSnafu)?;
    }
    encoder.shutdown().await.context(error::FileSnafu)?;

    store
        .put_bytes(
            &image_index_key(&key.repo, &key.digest),
            Bytes::from(encoder.into_inner()),
        )
        .await?;

    info!(target: "merge", "merged {} layers into {count} entries", layers.len());
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tar::TarHeader;
    use std::collections::BTreeMap as StdBTreeMap;

    fn entry(name: &str, parent: &str) -> Entry {
        let type_flag = if name.ends_with('/') { b'5' } else { b'0' };
        Entry {
            offset: 512,
            spans: vec![1],
            hdr: TarHeader {
                name: name.to_string(),
                type_flag,
                linkname: None,
                size: 0,
                mode: 0o644,
                uid: 0,
                gid: 0,
                uname: None,
                gname: None,
                mod_time: Default::default(),
                pax: StdBTreeMap::new(),
            },
            parent: parent.to_string(),
        }
    }

    fn paths(map: &BTreeMap<String, Contributed>) -> Vec<&str> {
        map.keys().map(|k| k.as_str()).collect()
    }

    #[test]
    fn test_whiteout_deletes_earlier_file() {
        let mut map = BTreeMap::new();
        apply_layer(
            &mut map,
            vec![
                entry("a/", "/"),
                entry("a/x", "a/"),
                entry("a/y", "a/"),
            ],
            "sha256:layer-a",
            0,
        );
        apply_layer(
            &mut map,
            vec![entry("a/.wh.x", "a/")],
            "sha256:layer-b",
            1,
        );
        assert_eq!(paths(&map), vec!["a/", "a/y"]);
        assert!(!map.values().any(|c| c.entry.hdr.name.contains(".wh.")));
    }

    #[test]
    fn test_whiteout_deletes_directory_form() {
        let mut map = BTreeMap::new();
        apply_layer(
            &mut map,
            vec![entry("a/", "/"), entry("a/sub/", "a/")],
            "sha256:layer-a",
            0,
        );
        apply_layer(
            &mut map,
            vec![entry("a/.wh.sub", "a/")],
            "sha256:layer-b",
            1,
        );
        assert_eq!(paths(&map), vec!["a/"]);
    }

    #[test]
    fn test_whiteout_ignores_same_layer_entry() {
        let mut map = BTreeMap::new();
        apply_layer(
            &mut map,
            vec![entry("a/x", "a/"), entry("a/.wh.x", "a/")],
            "sha256:layer-a",
            0,
        );
        // x came from this very layer; the whiteout only shadows earlier ones
        assert_eq!(paths(&map), vec!["a/x"]);
    }

    #[test]
    fn test_opaque_whiteout_clears_earlier_contents() {
        let mut map = BTreeMap::new();
        apply_layer(
            &mut map,
            vec![
                entry("etc/", "/"),
                entry("etc/hosts", "etc/"),
                entry("etc/apt/", "etc/"),
                entry("etc/apt/sources.list", "etc/apt/"),
                entry("var/", "/"),
                entry("var/log", "var/"),
            ],
            "sha256:layer-a",
            0,
        );
        apply_layer(
            &mut map,
            vec![
                entry("etc/", "/"),
                entry("etc/.wh..wh..opq", "etc/"),
                entry("etc/hostname", "etc/"),
            ],
            "sha256:layer-b",
            1,
        );
        assert_eq!(
            paths(&map),
            vec!["etc/", "etc/hostname", "var/", "var/log"]
        );
        // The surviving directory entry is the newer layer's
        assert_eq!(map["etc/"].layer, "sha256:layer-b");
    }

    #[test]
    fn test_opaque_whiteout_spares_current_layer() {
        let mut map = BTreeMap::new();
        apply_layer(
            &mut map,
            vec![entry("etc/", "/"), entry("etc/old", "etc/")],
            "sha256:layer-a",
            0,
        );
        // The new layer writes its file before the opaque marker arrives in
        // stream order; the marker must not delete it
        apply_layer(
            &mut map,
            vec![
                entry("etc/fresh", "etc/"),
                entry("etc/.wh..wh..opq", "etc/"),
            ],
            "sha256:layer-b",
            1,
        );
        assert_eq!(paths(&map), vec!["etc/", "etc/fresh"]);
    }

    #[test]
    fn test_later_layer_overwrites() {
        let mut map = BTreeMap::new();
        apply_layer(&mut map, vec![entry("app/bin", "app/")], "sha256:layer-a", 0);
        apply_layer(&mut map, vec![entry("app/bin", "app/")], "sha256:layer-b", 1);
        assert_eq!(map["app/bin"].layer, "sha256:layer-b");
    }
}
