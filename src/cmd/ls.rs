use clap::Parser;

use ocipeek::browse::Browser;
use ocipeek::ingest;
use ocipeek::merge::MergedEntry;
use ocipeek::meta::ImageKey;
use ocipeek::uri::ImageRef;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[command(version, about = "List a directory of an indexed image", long_about = None)]
pub struct Ls {
    /// Image reference (a tag is resolved to its digest)
    image: String,
    /// Directory to list
    #[arg(default_value = "/")]
    path: String,
    #[arg(short, long)]
    insecure: bool,
    /// Print the contributing layer digest per entry
    #[arg(short, long)]
    layers: bool,
}

impl Ls {
    pub async fn run(&self, ctx: &Ctx) -> anyhow::Result<()> {
        let mut image = ImageRef::parse(self.image.as_str())?;
        if self.insecure {
            image.set_secure(false);
        }
        let image = ingest::resolve(&image, None).await?;
        let digest = image.digest().expect("resolved image carries a digest");
        let key = ImageKey::new(image.repo(), digest);

        let browser = Browser::new(ctx.blob.clone())?;
        let entries = browser.list_directory(&key, self.path.as_str()).await?;
        for entry in entries {
            println!("{}", render(&entry, self.layers));
        }
        Ok(())
    }
}

fn render(entry: &MergedEntry, with_layer: bool) -> String {
    let hdr = &entry.entry.hdr;
    let kind = match hdr.type_flag {
        b'5' => 'd',
        b'2' => 'l',
        b'1' => 'h',
        b'3' | b'4' => 'c',
        b'6' => 'p',
        _ => '-',
    };
    let link = match hdr.linkname.as_ref() {
        Some(target) => format!(" -> {target}"),
        None => String::new(),
    };
    let layer = if with_layer {
        format!("  [{}]", entry.layer)
    } else {
        String::new()
    };
    format!(
        "{kind}{:04o} {:>5}/{:<5} {:>12} {}{link}{layer}",
        hdr.mode, hdr.uid, hdr.gid, hdr.size, hdr.name,
    )
}
