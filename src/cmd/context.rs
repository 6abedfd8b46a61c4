use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cfg_if::cfg_if;

use ocipeek::meta::{FsMetadataStore, MetadataStore};
use ocipeek::store::{BlobStore, FsBlobStore};

/// Shared backends for all subcommands: either the AWS pair selected by
/// `OCIPEEK_BUCKET`/`OCIPEEK_TABLE`, or a local store directory.
pub struct Ctx {
    pub blob: Arc<dyn BlobStore>,
    pub meta: Arc<dyn MetadataStore>,
}

impl Ctx {
    pub async fn open(store_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        cfg_if! {
            if #[cfg(feature = "aws")] {
                if let (Ok(bucket), Ok(table)) = (
                    std::env::var("OCIPEEK_BUCKET"),
                    std::env::var("OCIPEEK_TABLE"),
                ) {
                    tracing::debug!(target: "cmd", "using s3://{bucket} and dynamodb table {table}");
                    return Ok(Self {
                        blob: Arc::new(ocipeek::aws::S3BlobStore::from_env(bucket).await),
                        meta: Arc::new(ocipeek::aws::DynamoMetadataStore::from_env(table).await),
                    });
                }
            }
        }

        let root = match store_dir {
            Some(dir) => dir,
            None => home::home_dir()
                .context("could not determine a home directory for the local store")?
                .join(".ocipeek"),
        };
        tokio::fs::create_dir_all(&root)
            .await
            .context("creating local store directory")?;
        tracing::debug!(target: "cmd", "using local store at {root:?}");
        Ok(Self {
            blob: Arc::new(FsBlobStore::new(root.join("blobs"))),
            meta: Arc::new(FsMetadataStore::new(root.join("meta"))),
        })
    }
}
