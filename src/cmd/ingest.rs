use clap::Parser;
use tokio_util::sync::CancellationToken;

use ocipeek::error::Error;
use ocipeek::ingest::{self, Ingestor};
use ocipeek::meta::ImageKey;
use ocipeek::models::Platform;
use ocipeek::uri::ImageRef;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[command(version, about = "Index an image so its filesystem can be browsed", long_about = None)]
pub struct Ingest {
    /// Image reference, e.g. mcr.microsoft.com/dotnet/sdk:6.0
    image: String,
    /// Platform to resolve a multi-arch tag to, e.g. linux/arm64
    #[arg(short, long)]
    platform: Option<String>,
    #[arg(short, long)]
    insecure: bool,
    /// Checkpoint spacing in MiB (defaults to the index tool's 10)
    #[arg(long)]
    span_mib: Option<u32>,
}

impl Ingest {
    pub async fn run(&self, ctx: &Ctx) -> anyhow::Result<()> {
        let mut image = ImageRef::parse(self.image.as_str())?;
        if self.insecure {
            image.set_secure(false);
        }

        let platform = self.platform.clone().map(Platform::from);
        let image = ingest::resolve(&image, platform).await?;
        info!(target: "cmd", "resolved image to {image}");

        let mut ingestor = Ingestor::new(ctx.blob.clone(), ctx.meta.clone());
        ingestor.span_mib = self.span_mib;

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                warn!(target: "cmd", "interrupt received, cancelling");
                cancel.cancel();
            }
        });

        #[cfg(feature = "progress")]
        let bars = self.spawn_progress_bars(ctx, &image, cancel.clone());

        let result = ingestor.run(&image, &cancel).await;

        #[cfg(feature = "progress")]
        bars.abort();

        match result {
            Ok(report) => {
                println!(
                    "indexed {} ({} layers, {} entries, {} compressed bytes) as job {}",
                    report.key.digest,
                    report.layers,
                    report.entries,
                    report.total_size,
                    report.execution_id,
                );
                Ok(())
            }
            Err(Error::Conflict { .. }) => {
                // Another worker owns this image; report its current state
                let digest = image.digest().expect("resolved image carries a digest");
                let key = ImageKey::new(image.repo(), digest);
                match ctx.meta.get_image(&key).await? {
                    Some(existing) => {
                        println!(
                            "already in progress: job {} is {:?}",
                            existing.execution_id, existing.status,
                        );
                        Ok(())
                    }
                    None => anyhow::bail!("job conflict but no image row found"),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the layer progress rows once a second and render one bar per
    /// layer, the same rows the web surface polls.
    #[cfg(feature = "progress")]
    fn spawn_progress_bars(
        &self,
        ctx: &Ctx,
        image: &ImageRef,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
        use std::collections::HashMap;

        let meta = ctx.meta.clone();
        let digest = image.digest().expect("resolved image carries a digest");
        let key = ImageKey::new(image.repo(), digest);

        tokio::spawn(async move {
            let multi = MultiProgress::new();
            let mut bars: HashMap<String, ProgressBar> = HashMap::new();
            let style = ProgressStyle::with_template(
                "<- {prefix}: [{elapsed_precise}] {bar:40.cyan/blue} ({binary_bytes:>7}/{binary_total_bytes:7})",
            )
            .expect("progress template is valid")
            .progress_chars("##-");

            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let Ok(progresses) = meta.list_layer_progress(&key).await else {
                    continue;
                };
                for progress in progresses {
                    let bar = bars
                        .entry(progress.key.layer_digest.clone())
                        .or_insert_with(|| {
                            let bar = multi.add(ProgressBar::new(progress.total_bytes));
                            bar.set_style(style.clone());
                            let short = progress
                                .key
                                .layer_digest
                                .strip_prefix("sha256:")
                                .unwrap_or(&progress.key.layer_digest);
                            bar.set_prefix(format!("blob {}", &short[..9.min(short.len())]));
                            bar
                        });
                    bar.set_position(progress.completed_bytes);
                }
            }
        })
    }
}
