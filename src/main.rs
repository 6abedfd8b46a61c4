#[macro_use]
extern crate tracing;

use std::path::PathBuf;

use clap::Parser;

use crate::cmd::cat::Cat;
use crate::cmd::context::Ctx;
use crate::cmd::info::Info;
use crate::cmd::ingest::Ingest;
use crate::cmd::ls::Ls;
use crate::cmd::spans::Spans;

mod cmd;

#[derive(Parser, Debug)]
#[command(
    name = "ocipeek",
    version,
    about = "Browse OCI image filesystems without downloading whole images"
)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
    /// Local store directory (defaults to ~/.ocipeek; ignored when
    /// OCIPEEK_BUCKET and OCIPEEK_TABLE select the AWS backends)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Commands {
    Ingest(Ingest),
    Ls(Ls),
    Cat(Cat),
    Info(Info),
    Spans(Spans),
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    cfg_if::cfg_if! {
        if #[cfg(feature = "progress")] {
            let indicatif_layer = tracing_indicatif::IndicatifLayer::new();
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(indicatif_layer.get_stderr_writer()),
                )
                .with(indicatif_layer)
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let ctx = Ctx::open(args.store).await?;

    match args.command {
        Commands::Ingest(cmd) => cmd.run(&ctx).await?,
        Commands::Ls(cmd) => cmd.run(&ctx).await?,
        Commands::Cat(cmd) => cmd.run(&ctx).await?,
        Commands::Info(cmd) => cmd.run(&ctx).await?,
        Commands::Spans(cmd) => cmd.run(&ctx).await?,
    }
    Ok(())
}
