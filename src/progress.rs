//! Live progress for one in-flight layer: two relaxed atomic counters shared
//! between the streaming indexer and a periodic reporter task that owns the
//! metadata writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::meta::{LayerProgressKey, MetadataStore};

/// Byte and file counters for one layer indexing task. Writers use relaxed
/// fetch-adds, readers relaxed loads; these are the only shared mutable
/// state inside a layer task.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub bytes: Arc<AtomicU64>,
    pub files: Arc<AtomicU64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }
}

/// Spawn the reporter task for one layer. It writes the current counters to
/// the progress row once a second (after a random sub-second delay so
/// concurrent layers do not storm the store together) and performs one final
/// synchronous write when the token is cancelled, before the task finishes.
/// Reporter failures are logged and never propagated to the indexer.
pub fn spawn_reporter(
    meta: Arc<dyn MetadataStore>,
    key: LayerProgressKey,
    counters: Counters,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let update = |bytes: u64, files: u64| {
            let meta = meta.clone();
            let key = key.clone();
            async move {
                if let Err(e) = meta.update_layer_progress(&key, bytes, files).await {
                    warn!(target: "progress", "failed to report layer progress: {e}");
                }
            }
        };

        let jitter = rand::rng().random_range(0..1000);
        tokio::select! {
            _ = cancel.cancelled() => {
                update(counters.bytes(), counters.files()).await;
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
        }

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    update(counters.bytes(), counters.files()).await;
                    return;
                }
                _ = tick.tick() => {
                    update(counters.bytes(), counters.files()).await;
                }
            }
        }
    })
}
