//! End-to-end tests over synthetic layers: index, merge, query, extract.
//! Tests that exercise the external index tool probe for it first and skip
//! when it is not installed.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_compression::tokio::write::GzipEncoder;
use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use tokio::io::AsyncWriteExt;
use tokio_tar::{Builder as TarBuilder, EntryType, Header};
use tokio_util::sync::CancellationToken;

use ocipeek::browse::Browser;
use ocipeek::extract::{extract_entry, FileRangeSource};
use ocipeek::indexer::{index_layer, IndexArtifacts};
use ocipeek::merge::{merge_layers, MergedEntry};
use ocipeek::meta::ImageKey;
use ocipeek::progress::Counters;
use ocipeek::query::{self, Predicate};
use ocipeek::store::{image_index_key, layer_files_key, BlobStore, FsBlobStore};
use ocipeek::tar::{Entry, TarHeader};
use ocipeek::{error::Error, gzi};

fn gztool_available() -> bool {
    std::process::Command::new("gztool")
        .arg("-v")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

macro_rules! require_gztool {
    () => {
        if !gztool_available() {
            eprintln!("gztool not installed, skipping");
            return;
        }
    };
}

enum Member<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
}

/// Build a gzip-compressed tar layer from the given members
async fn layer_tar_gz(members: &[Member<'_>]) -> Vec<u8> {
    let mut builder = TarBuilder::new(Vec::new());
    for member in members {
        let mut header = Header::new_gnu();
        header.set_mtime(1700000000);
        header.set_uid(0);
        header.set_gid(0);
        match member {
            Member::Dir(path) => {
                header.set_entry_type(EntryType::dir());
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, path, &[][..])
                    .await
                    .unwrap();
            }
            Member::File(path, body) => {
                header.set_entry_type(EntryType::file());
                header.set_mode(0o644);
                header.set_size(body.len() as u64);
                builder.append_data(&mut header, path, *body).await.unwrap();
            }
            Member::Symlink(path, target) => {
                header.set_entry_type(EntryType::symlink());
                header.set_mode(0o777);
                header.set_size(0);
                header.set_link_name(target).unwrap();
                builder.append_data(&mut header, path, &[][..]).await.unwrap();
            }
        }
    }
    let tar = builder.into_inner().await.unwrap();

    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(&tar).await.unwrap();
    encoder.shutdown().await.unwrap();
    encoder.into_inner()
}

/// Index a staged layer file the way the ingestor does, with 1 MiB spans so
/// small fixtures still cross checkpoints.
async fn index_fixture(layer_path: &Path, workdir: &Path) -> ocipeek::Result<IndexArtifacts> {
    let file = tokio::fs::File::open(layer_path).await.unwrap();
    let counters = Counters::new();
    let cancel = CancellationToken::new();
    index_layer(file, workdir, &counters, &cancel, Some(1)).await
}

/// Store a hand-built per-layer file index, bypassing the index tool
async fn store_layer_index(store: &FsBlobStore, layer_digest: &str, entries: &[Entry]) {
    let mut encoder = GzipEncoder::new(Vec::new());
    for entry in entries {
        encoder
            .write_all(&serde_json::to_vec(entry).unwrap())
            .await
            .unwrap();
        encoder.write_all(b"\n").await.unwrap();
    }
    encoder.shutdown().await.unwrap();
    store
        .put_bytes(&layer_files_key(layer_digest), Bytes::from(encoder.into_inner()))
        .await
        .unwrap();
}

fn row(name: &str, parent: &str, size: u64) -> Entry {
    let type_flag = if name.ends_with('/') { b'5' } else { b'0' };
    Entry {
        offset: 512,
        spans: vec![1],
        hdr: TarHeader {
            name: name.to_string(),
            type_flag,
            linkname: None,
            size,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            mod_time: Default::default(),
            pax: BTreeMap::new(),
        },
        parent: parent.to_string(),
    }
}

#[tokio::test]
async fn indexes_and_extracts_single_file() {
    require_gztool!();

    let dir = tempfile::tempdir().unwrap();
    let layer_path = dir.path().join("layer.tar.gz");
    let compressed = layer_tar_gz(&[Member::File("hello", b"world\n")]).await;
    tokio::fs::write(&layer_path, &compressed).await.unwrap();

    let workdir = tempfile::tempdir().unwrap();
    let artifacts = index_fixture(&layer_path, workdir.path()).await.unwrap();

    assert_eq!(artifacts.entries.len(), 1);
    let entry = &artifacts.entries[0];
    assert_eq!(entry.hdr.name, "hello");
    assert_eq!(entry.parent, "/");
    // Body begins right after the 512-byte header block
    assert_eq!(entry.offset, 512);
    assert_eq!(entry.hdr.size, 6);
    assert!(!entry.spans.is_empty());

    let spans = gzi::list_spans(&artifacts.gzi_path).await.unwrap();
    let source = FileRangeSource::new(&layer_path);
    let body = extract_entry(&source, &artifacts.gzi_path, &spans, entry)
        .await
        .unwrap();
    assert_eq!(body, b"world\n");
}

#[tokio::test]
async fn counters_track_bytes_and_files() {
    require_gztool!();

    let dir = tempfile::tempdir().unwrap();
    let layer_path = dir.path().join("layer.tar.gz");
    let compressed = layer_tar_gz(&[
        Member::Dir("a/"),
        Member::File("a/x", b"xx"),
        Member::File("a/y", b"yy"),
    ])
    .await;
    tokio::fs::write(&layer_path, &compressed).await.unwrap();

    let workdir = tempfile::tempdir().unwrap();
    let file = tokio::fs::File::open(&layer_path).await.unwrap();
    let counters = Counters::new();
    let cancel = CancellationToken::new();
    let artifacts = index_layer(file, workdir.path(), &counters, &cancel, None)
        .await
        .unwrap();

    assert_eq!(counters.bytes(), compressed.len() as u64);
    assert_eq!(counters.files(), 3);
    assert_eq!(artifacts.entries.len(), 3);
    assert_eq!(artifacts.bad_headers, 0);
}

#[tokio::test]
async fn entry_types_and_long_names_survive() {
    require_gztool!();

    let deep = format!("{}/{}", "d".repeat(70), "f".repeat(80));
    let dir = tempfile::tempdir().unwrap();
    let layer_path = dir.path().join("layer.tar.gz");
    let compressed = layer_tar_gz(&[
        Member::Dir("bin/"),
        Member::Symlink("bin/sh", "bash"),
        Member::File("empty", b""),
        Member::File(deep.as_str(), b"deep"),
    ])
    .await;
    tokio::fs::write(&layer_path, &compressed).await.unwrap();

    let workdir = tempfile::tempdir().unwrap();
    let artifacts = index_fixture(&layer_path, workdir.path()).await.unwrap();

    let by_name = |name: &str| {
        artifacts
            .entries
            .iter()
            .find(|e| e.hdr.name == name)
            .unwrap_or_else(|| panic!("missing entry {name}"))
    };

    // Directories keep their trailing slash and type
    assert_eq!(by_name("bin/").hdr.type_flag, b'5');
    // Symlinks keep their target
    assert_eq!(by_name("bin/sh").hdr.linkname.as_deref(), Some("bash"));
    // A 150-character path exceeds the classic header field and must come
    // back through the long-name extension intact
    assert_eq!(by_name(deep.as_str()).hdr.size, 4);
    // Zero-byte files cover exactly one checkpoint
    assert_eq!(by_name("empty").spans.len(), 1);

    // Ordering: depth ascending, lexicographic within depth
    let names: Vec<&str> = artifacts
        .entries
        .iter()
        .map(|e| e.hdr.name.as_str())
        .collect();
    let mut sorted = names.clone();
    sorted.sort_by_key(|n| {
        let trimmed = n.trim_end_matches('/');
        (trimmed.split('/').count(), trimmed.to_string())
    });
    assert_eq!(names, sorted);
}

#[tokio::test]
async fn multi_span_file_extracts_from_partial_range() {
    require_gztool!();

    // Incompressible payload so 1 MiB spans land inside the body
    let mut payload = vec![0u8; 3 << 20];
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    rng.fill_bytes(&mut payload);

    let dir = tempfile::tempdir().unwrap();
    let layer_path = dir.path().join("layer.tar.gz");
    let compressed = layer_tar_gz(&[
        Member::File("blob.bin", payload.as_slice()),
        Member::File("tail.txt", b"after the big one\n"),
    ])
    .await;
    tokio::fs::write(&layer_path, &compressed).await.unwrap();

    let workdir = tempfile::tempdir().unwrap();
    let artifacts = index_fixture(&layer_path, workdir.path()).await.unwrap();
    let spans = gzi::list_spans(&artifacts.gzi_path).await.unwrap();
    assert!(spans.len() >= 3, "expected several checkpoints, got {spans:?}");

    let blob = artifacts
        .entries
        .iter()
        .find(|e| e.hdr.name == "blob.bin")
        .unwrap();
    assert!(
        blob.spans.len() >= 2,
        "body crossing checkpoints needs several spans: {:?}",
        blob.spans
    );

    let source = FileRangeSource::new(&layer_path);
    let body = extract_entry(&source, &artifacts.gzi_path, &spans, blob)
        .await
        .unwrap();
    assert_eq!(body, payload);

    // The small file at the tail restarts from a late checkpoint rather
    // than the beginning of the blob
    let tail = artifacts
        .entries
        .iter()
        .find(|e| e.hdr.name == "tail.txt")
        .unwrap();
    assert!(tail.spans[0] > 1, "tail should not need the first span");
    let body = extract_entry(&source, &artifacts.gzi_path, &spans, tail)
        .await
        .unwrap();
    assert_eq!(body, b"after the big one\n");
}

#[tokio::test]
async fn reindexing_is_deterministic() {
    require_gztool!();

    let dir = tempfile::tempdir().unwrap();
    let layer_path = dir.path().join("layer.tar.gz");
    let compressed = layer_tar_gz(&[
        Member::Dir("etc/"),
        Member::File("etc/hosts", b"127.0.0.1 localhost\n"),
        Member::File("etc/hostname", b"box\n"),
    ])
    .await;
    tokio::fs::write(&layer_path, &compressed).await.unwrap();

    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let first = index_fixture(&layer_path, first_dir.path()).await.unwrap();
    let second = index_fixture(&layer_path, second_dir.path()).await.unwrap();

    let first_bytes = tokio::fs::read(&first.files_path).await.unwrap();
    let second_bytes = tokio::fs::read(&second.files_path).await.unwrap();
    assert_eq!(first_bytes, second_bytes);

    let first_spans = gzi::list_spans(&first.gzi_path).await.unwrap();
    let second_spans = gzi::list_spans(&second.gzi_path).await.unwrap();
    assert_eq!(first_spans, second_spans);
}

#[tokio::test]
async fn cancellation_aborts_without_artifacts() {
    require_gztool!();

    let dir = tempfile::tempdir().unwrap();
    let layer_path = dir.path().join("layer.tar.gz");
    let compressed = layer_tar_gz(&[Member::File("hello", b"world\n")]).await;
    tokio::fs::write(&layer_path, &compressed).await.unwrap();

    let workdir = tempfile::tempdir().unwrap();
    let file = tokio::fs::File::open(&layer_path).await.unwrap();
    let counters = Counters::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = index_layer(file, workdir.path(), &counters, &cancel, None).await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn whiteout_hides_earlier_file() {
    // Two-layer image: layer A adds a/x and a/y, layer B whites out x
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());

    store_layer_index(
        &store,
        "sha256:layer-a",
        &[
            row("a/", "/", 0),
            row("a/x", "a/", 3),
            row("a/y", "a/", 3),
        ],
    )
    .await;
    store_layer_index(&store, "sha256:layer-b", &[row("a/.wh.x", "a/", 0)]).await;

    let key = ImageKey::new("example.com/app", "sha256:image");
    let count = merge_layers(
        &store,
        &key,
        &["sha256:layer-a".to_string(), "sha256:layer-b".to_string()],
    )
    .await
    .unwrap();
    assert_eq!(count, 2);

    let browser = Browser::new(Arc::new(store)).unwrap();
    let listed = browser.list_directory(&key, "/a/").await.unwrap();
    let names: Vec<&str> = listed.iter().map(|e| e.entry.hdr.name.as_str()).collect();
    assert_eq!(names, vec!["a/y"]);
}

#[tokio::test]
async fn opaque_whiteout_hides_earlier_directory_contents() {
    // Layer A adds etc/hosts; layer B makes etc opaque and adds hostname
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());

    store_layer_index(
        &store,
        "sha256:layer-a",
        &[row("etc/", "/", 0), row("etc/hosts", "etc/", 20)],
    )
    .await;
    store_layer_index(
        &store,
        "sha256:layer-b",
        &[
            row("etc/", "/", 0),
            row("etc/.wh..wh..opq", "etc/", 0),
            row("etc/hostname", "etc/", 4),
        ],
    )
    .await;

    let key = ImageKey::new("example.com/app", "sha256:image");
    merge_layers(
        &store,
        &key,
        &["sha256:layer-a".to_string(), "sha256:layer-b".to_string()],
    )
    .await
    .unwrap();

    let browser = Browser::new(Arc::new(store)).unwrap();
    let listed = browser.list_directory(&key, "etc").await.unwrap();
    let names: Vec<&str> = listed.iter().map(|e| e.entry.hdr.name.as_str()).collect();
    assert_eq!(names, vec!["etc/hostname"]);
}

#[tokio::test]
async fn merged_index_keeps_contributing_layer() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());

    store_layer_index(&store, "sha256:layer-a", &[row("app/bin", "app/", 100)]).await;
    store_layer_index(&store, "sha256:layer-b", &[row("app/bin", "app/", 120)]).await;

    let key = ImageKey::new("example.com/app", "sha256:image");
    merge_layers(
        &store,
        &key,
        &["sha256:layer-a".to_string(), "sha256:layer-b".to_string()],
    )
    .await
    .unwrap();

    let predicate = Predicate::name("app/bin").unwrap();
    let matched: Vec<MergedEntry> = query::select(
        &store,
        &image_index_key(&key.repo, &key.digest),
        &predicate,
    )
    .await
    .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].layer, "sha256:layer-b");
    assert_eq!(matched[0].entry.hdr.size, 120);
}

#[tokio::test]
async fn browse_rejects_quoted_paths() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());
    let browser = Browser::new(Arc::new(store)).unwrap();
    let key = ImageKey::new("example.com/app", "sha256:image");

    let denied = browser.list_directory(&key, "/etc/o'clock/").await;
    assert!(matches!(denied, Err(Error::InvalidPath { .. })));
}

#[tokio::test]
async fn listing_missing_image_maps_to_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());
    let browser = Browser::new(Arc::new(store)).unwrap();
    let key = ImageKey::new("example.com/app", "sha256:never-ingested");

    let missing = browser.list_directory(&key, "/").await;
    assert!(matches!(missing, Err(Error::BlobNotFound { .. })));
}

#[tokio::test]
async fn full_layer_roundtrip_through_store() {
    require_gztool!();

    // Index a real layer, upload its artifacts, merge, and answer a
    // directory listing from the stored image index
    let dir = tempfile::tempdir().unwrap();
    let layer_path = dir.path().join("layer.tar.gz");
    let compressed = layer_tar_gz(&[
        Member::Dir("srv/"),
        Member::File("srv/index.html", b"<h1>hi</h1>\n"),
    ])
    .await;
    tokio::fs::write(&layer_path, &compressed).await.unwrap();

    let workdir = tempfile::tempdir().unwrap();
    let artifacts = index_fixture(&layer_path, workdir.path()).await.unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(store_dir.path());
    store
        .put_file("layers/sha256:only/index.gzi", &artifacts.gzi_path)
        .await
        .unwrap();
    store
        .put_file("layers/sha256:only/files.json.gz", &artifacts.files_path)
        .await
        .unwrap();

    let key = ImageKey::new("example.com/site", "sha256:image");
    merge_layers(&store, &key, &["sha256:only".to_string()])
        .await
        .unwrap();

    let browser = Browser::new(Arc::new(store)).unwrap();
    let listed = browser.list_directory(&key, "srv/").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].entry.hdr.name, "srv/index.html");
    assert_eq!(listed[0].layer, "sha256:only");
}
