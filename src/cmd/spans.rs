use clap::Parser;
use snafu::ResultExt;

use ocipeek::error;
use ocipeek::gzi;
use ocipeek::store::layer_gzi_key;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[command(version, about = "List the gzip checkpoints of an indexed layer", long_about = None)]
pub struct Spans {
    /// Layer digest, e.g. sha256:a603fa5e...
    layer: String,
}

impl Spans {
    pub async fn run(&self, ctx: &Ctx) -> anyhow::Result<()> {
        let bytes = ctx.blob.get(&layer_gzi_key(self.layer.as_str())).await?;

        let dir = tempfile::tempdir().context(error::DirectorySnafu)?;
        let index_path = dir.path().join("index.gzi");
        tokio::fs::write(&index_path, &bytes)
            .await
            .context(error::FileSnafu)?;

        let spans = gzi::list_spans(&index_path).await?;
        println!("{:>6} {:>14} {:>14}", "span", "compressed", "uncompressed");
        for span in spans {
            println!(
                "{:>6} {:>14} {:>14}",
                span.number, span.compressed, span.uncompressed,
            );
        }
        Ok(())
    }
}
