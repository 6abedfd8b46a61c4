//! Streaming queries over gzipped newline-delimited JSON index artifacts.
//!
//! The interface mirrors an object-store-side select service (one equality
//! predicate on a known field) but filters client-side while decompressing.
//! The predicate value is user-influenced via request paths, so the
//! single-quote delimiter of the SQL dialect select-capable backends speak is
//! rejected here once, in the constructor, rather than at every call site.

use async_compression::tokio::bufread::GzipDecoder;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::store::BlobStore;
use crate::{error, Result};

/// Queryable fields of an index row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// The entry's full name (`Hdr.Name`)
    Name,
    /// The entry's parent directory (`Parent`)
    Parent,
}

impl Field {
    fn pointer(&self) -> &'static str {
        match self {
            Field::Name => "/Hdr/Name",
            Field::Parent => "/Parent",
        }
    }
}

/// A single equality predicate over index rows
#[derive(Debug, Clone)]
pub struct Predicate {
    field: Field,
    value: String,
}

impl Predicate {
    /// Build a predicate, rejecting values containing the string delimiter
    /// of the select dialect.
    pub fn new(field: Field, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.contains('\'') {
            return error::InvalidPathSnafu { path: value }.fail();
        }
        Ok(Self { field, value })
    }

    pub fn name(value: impl Into<String>) -> Result<Self> {
        Self::new(Field::Name, value)
    }

    pub fn parent(value: impl Into<String>) -> Result<Self> {
        Self::new(Field::Parent, value)
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    fn matches(&self, record: &serde_json::Value) -> bool {
        record
            .pointer(self.field.pointer())
            .and_then(|v| v.as_str())
            .is_some_and(|v| v == self.value)
    }
}

/// Stream the gzipped NDJSON object at `key` and return every record the
/// predicate selects, deserialized as `T`.
pub async fn select<T>(store: &dyn BlobStore, key: &str, predicate: &Predicate) -> Result<Vec<T>>
where
    T: DeserializeOwned,
{
    let reader = store.get_reader(key).await?;
    let decoder = GzipDecoder::new(BufReader::new(reader));
    let mut lines = BufReader::new(decoder).lines();

    let mut matched = Vec::new();
    while let Some(line) = lines.next_line().await.context(error::ArchiveSnafu)? {
        if line.is_empty() {
            continue;
        }
        let record: serde_json::Value =
            serde_json::from_str(&line).context(error::IndexEntryDeserializeSnafu)?;
        if predicate.matches(&record) {
            matched.push(serde_json::from_value(record).context(error::IndexEntryDeserializeSnafu)?);
        }
    }
    trace!(target: "query", "select over {key} matched {} records", matched.len());
    Ok(matched)
}
