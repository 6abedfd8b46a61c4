use clap::Parser;

use ocipeek::ingest;
use ocipeek::meta::ImageKey;
use ocipeek::uri::ImageRef;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[command(version, about = "Show the job row and per-layer progress for an image", long_about = None)]
pub struct Info {
    /// Image reference (a tag is resolved to its digest)
    image: String,
    #[arg(short, long)]
    insecure: bool,
}

impl Info {
    pub async fn run(&self, ctx: &Ctx) -> anyhow::Result<()> {
        let mut image = ImageRef::parse(self.image.as_str())?;
        if self.insecure {
            image.set_secure(false);
        }
        let image = ingest::resolve(&image, None).await?;
        let digest = image.digest().expect("resolved image carries a digest");
        let key = ImageKey::new(image.repo(), digest);

        let Some(item) = ctx.meta.get_image(&key).await? else {
            println!("no job found for {image}; run `ocipeek ingest {image}` first");
            return Ok(());
        };

        println!("image:     {}@{}", item.key.repo, item.key.digest);
        if !item.tags.is_empty() {
            println!("tags:      {}", item.tags.join(", "));
        }
        println!("status:    {:?}", item.status);
        println!("execution: {}", item.execution_id);
        println!("retrieved: {}", item.retrieved.to_rfc3339());
        println!("size:      {} compressed bytes", item.total_size);
        if item.duration > 0 {
            println!("duration:  {:.1}s", item.duration as f64 / 1000.0);
        } else {
            println!("estimate:  ~{}s", item.estimate_seconds());
        }

        let progresses = ctx.meta.list_layer_progress(&key).await?;
        if !progresses.is_empty() {
            let completed: u64 = progresses.iter().map(|p| p.completed_bytes).sum();
            println!("completed: {completed} bytes");
            for progress in progresses {
                println!(
                    "  {}: {}/{} bytes, {} files",
                    progress.key.layer_digest,
                    progress.completed_bytes,
                    progress.total_bytes,
                    progress.completed_files,
                );
            }
        }
        Ok(())
    }
}
