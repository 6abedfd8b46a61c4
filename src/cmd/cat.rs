use clap::Parser;
use tokio::io::AsyncWriteExt;

use ocipeek::browse::Browser;
use ocipeek::ingest;
use ocipeek::uri::ImageRef;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[command(version, about = "Print a file from an indexed image", long_about = None)]
pub struct Cat {
    /// Image reference (a tag is resolved to its digest)
    image: String,
    /// File to read
    path: String,
    #[arg(short, long)]
    insecure: bool,
}

impl Cat {
    pub async fn run(&self, ctx: &Ctx) -> anyhow::Result<()> {
        let mut image = ImageRef::parse(self.image.as_str())?;
        if self.insecure {
            image.set_secure(false);
        }
        let image = ingest::resolve(&image, None).await?;

        let browser = Browser::new(ctx.blob.clone())?;
        let body = browser.read_file(&image, self.path.as_str()).await?;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(body.as_slice()).await?;
        stdout.flush().await?;
        Ok(())
    }
}
