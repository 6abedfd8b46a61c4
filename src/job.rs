//! Per-image job lifecycle over the metadata store. One row per
//! `(repo, digest)`; conditional writes give at-most-one active job without
//! any locking. Retry policy lives with the orchestrator, not here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use snafu::ResultExt;
use uuid::Uuid;

use crate::meta::{ImageInfoItem, ImageInfoItemBuilder, ImageKey, MetadataStore, Status};
use crate::{error, Result};

/// Time-ordered execution identifier; later executions sort after earlier
/// ones lexicographically.
pub fn new_execution_id() -> String {
    Uuid::now_v7().to_string()
}

pub struct JobLifecycle {
    meta: Arc<dyn MetadataStore>,
}

impl JobLifecycle {
    pub fn new(meta: Arc<dyn MetadataStore>) -> Self {
        Self { meta }
    }

    /// Conditionally insert the job row in PENDING with a fresh execution
    /// id. A `Conflict` means another worker owns this image; callers report
    /// the existing row's status instead of treating it as a failure.
    pub async fn create(&self, key: &ImageKey, tags: Vec<String>) -> Result<ImageInfoItem> {
        let item = ImageInfoItemBuilder::default()
            .key(key.clone())
            .tags(tags)
            .retrieved(Utc::now())
            .execution_id(new_execution_id())
            .status(Status::Pending)
            .build()
            .context(error::ItemInvalidSnafu)?;
        self.meta.create_image(&item).await?;
        info!(
            target: "job",
            "created job {} for {}@{}",
            item.execution_id,
            key.repo,
            key.digest,
        );
        Ok(item)
    }

    /// Advance PENDING → RUNNING, conditional on still owning the row. A
    /// `Conflict` means another worker took over; the caller aborts.
    pub async fn start(&self, key: &ImageKey, execution_id: &str) -> Result<()> {
        self.meta.set_image_running(key, execution_id).await
    }

    /// Terminal update, called exactly once per job whatever the outcome.
    pub async fn finalize(
        &self,
        key: &ImageKey,
        execution_id: &str,
        start_time: DateTime<Utc>,
        status: Status,
    ) -> Result<()> {
        let duration_ms = (Utc::now() - start_time).num_milliseconds().max(0) as u64;
        info!(
            target: "job",
            "finalizing job {execution_id} for {}@{} as {status:?} after {duration_ms}ms",
            key.repo,
            key.digest,
        );
        self.meta
            .finalize_image(key, status, duration_ms, execution_id)
            .await
    }

    /// Current job row, if any
    pub async fn status(&self, key: &ImageKey) -> Result<Option<ImageInfoItem>> {
        self.meta.get_image(key).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::FsMetadataStore;

    fn lifecycle(dir: &std::path::Path) -> JobLifecycle {
        JobLifecycle::new(Arc::new(FsMetadataStore::new(dir)))
    }

    #[test]
    fn test_execution_ids_sort() {
        let first = new_execution_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_execution_id();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_competing_creates() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = lifecycle(dir.path());
        let key = ImageKey::new("example.com/app", "sha256:abc");

        let winner = jobs.create(&key, vec!["latest".to_string()]).await.unwrap();
        assert_eq!(winner.status, Status::Pending);

        // The losing worker sees a conflict and reports the existing job
        let loser = jobs.create(&key, vec![]).await;
        assert!(matches!(loser, Err(crate::error::Error::Conflict { .. })));
        let existing = jobs.status(&key).await.unwrap().unwrap();
        assert_eq!(existing.execution_id, winner.execution_id);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = lifecycle(dir.path());
        let key = ImageKey::new("example.com/app", "sha256:abc");

        let item = jobs.create(&key, vec![]).await.unwrap();
        jobs.start(&key, &item.execution_id).await.unwrap();
        assert_eq!(
            jobs.status(&key).await.unwrap().unwrap().status,
            Status::Running
        );

        jobs.finalize(&key, &item.execution_id, item.retrieved, Status::Succeeded)
            .await
            .unwrap();
        let done = jobs.status(&key).await.unwrap().unwrap();
        assert_eq!(done.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_start_after_takeover_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = lifecycle(dir.path());
        let key = ImageKey::new("example.com/app", "sha256:abc");

        jobs.create(&key, vec![]).await.unwrap();
        let stale = jobs.start(&key, "some-other-execution").await;
        assert!(matches!(stale, Err(crate::error::Error::Conflict { .. })));
    }
}
