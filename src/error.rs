use std::num::ParseIntError;

use reqwest::header::ToStrError;
use snafu::Snafu;
use tokio::task::JoinError;

use crate::meta::ImageInfoItemBuilderError;
use crate::models::ErrorResponse;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("failed to interact with tar stream: {source}"))]
    Archive { source: std::io::Error },
    #[snafu(display("registry refused authorization: {reason}"))]
    AuthFailed { reason: String },
    #[snafu(display("no blob stored at key '{key}'"))]
    BlobNotFound { key: String },
    #[snafu(display("failed to deserialize response body: {source}"))]
    BodyDeserialize { source: serde_json::Error },
    #[snafu(display("operation was cancelled"))]
    Cancelled,
    #[snafu(display("oci registry did not return the content length"))]
    ContentLengthMissing,
    #[snafu(display("content-length was not a valid number: {source}"))]
    ContentLengthNotNumber { source: ParseIntError },
    #[snafu(display("conditional metadata write failed: {reason}"))]
    Conflict { reason: String },
    #[snafu(display("compressed stream is corrupt: {reason}"))]
    CorruptStream { reason: String },
    #[snafu(display("failed to perform operation with directory: {source}"))]
    Directory { source: std::io::Error },
    #[snafu(display("no entry named '{path}' in image index"))]
    EntryNotFound { path: String },
    #[snafu(display("failed to deserialize error response from oci registry: {source}"))]
    ErrorDeserialize { source: reqwest::Error },
    #[snafu(display("failed to fetch blob: {reason}"))]
    FetchBlob { reason: ErrorResponse },
    #[snafu(display("failed to fetch manifest: {reason}"))]
    FetchManifest { reason: ErrorResponse },
    #[snafu(display("failed to interact with local file: {source}"))]
    File { source: std::io::Error },
    #[snafu(display("oci registry did not return a proper header"))]
    ImproperHeader { source: ToStrError },
    #[snafu(display("failed to deserialize index entry: {source}"))]
    IndexEntryDeserialize { source: serde_json::Error },
    #[snafu(display("index does not contain an image for the platform: {platform}"))]
    IndexNoPlatform { platform: String },
    #[snafu(display("failed to run gzip index tool: {source}"))]
    IndexTool { source: std::io::Error },
    #[snafu(display("gzip index tool (gztool) was not found on PATH"))]
    IndexToolMissing,
    #[snafu(display("invalid algorithm in digest: {algorithm}"))]
    InvalidAlgorithm { algorithm: String },
    #[snafu(display("path contains disallowed characters: {path}"))]
    InvalidPath { path: String },
    #[snafu(display("failed to build image metadata item: {source}"))]
    ItemInvalid { source: ImageInfoItemBuilderError },
    #[snafu(display("malformed image reference provided: {reason}"))]
    MalformedUri { reason: String },
    #[snafu(display("no gzip index checkpoint covers uncompressed offset {offset}"))]
    OffsetNotIndexed { offset: u64 },
    #[snafu(display("failed to make request to oci registry: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("failed to parse response from oci registry: {source}"))]
    ResponseDeserialize { source: reqwest::Error },
    #[snafu(display("failed to serialize to json: {source}"))]
    Serialize { source: serde_json::Error },
    #[snafu(display("failed to wait for layer task: {source}"))]
    TaskJoin { source: JoinError },
    #[snafu(display("registry response truncated: expected {expected} bytes, got {actual}"))]
    Truncated { expected: u64, actual: u64 },
    #[snafu(display("expected exactly one index entry for '{path}', found {count}"))]
    UnexpectedEntryCount { path: String, count: usize },
    #[snafu(display("unsupported layer compression for media type '{media_type}'"))]
    UnsupportedLayerCompression { media_type: String },
    #[snafu(display("metadata or object store unavailable: {reason}"))]
    Upstream { reason: String },
    #[snafu(display("invalid url detected: {source}"))]
    Url { source: url::ParseError },
}
