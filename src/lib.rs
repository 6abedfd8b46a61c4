#[macro_use]
extern crate tracing;

#[cfg(feature = "aws")]
pub mod aws;
pub mod browse;
pub(crate) mod client;
pub mod error;
pub mod extract;
pub mod gzi;
pub mod indexer;
pub mod ingest;
pub mod job;
pub mod merge;
pub mod meta;
pub mod models;
pub mod progress;
pub mod query;
pub mod registry;
pub mod store;
pub mod tar;
pub mod uri;

pub type Result<T> = std::result::Result<T, error::Error>;
