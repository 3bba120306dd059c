use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fluxion::config::FluxionConfig;
use fluxion::install::install_archive;

#[derive(Parser)]
#[command(name = "fluxion", version, about = "Meta HTTP server driven by a dynamic directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the dynamic directory.
    Serve(ServeArgs),
    /// Install a module archive (.tar, .tar.gz, .tgz) into the directory.
    Install(InstallArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Dynamic directory to serve from.
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// JSON config file; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Hard cap on buffered request bodies, in bytes.
    #[arg(long)]
    max_request_bytes: Option<u64>,

    /// Declared database name (repeatable).
    #[arg(long = "database")]
    databases: Vec<String>,
}

#[derive(Args)]
struct InstallArgs {
    /// Dynamic directory to install into.
    #[arg(short, long)]
    dir: PathBuf,

    /// Archive path.
    archive: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluxion=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Install(args) => install(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str::<FluxionConfig>(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => {
            let Some(dir) = args.dir.clone() else {
                bail!("either --dir or --config is required");
            };
            FluxionConfig::new(dir)
        }
    };

    if let Some(dir) = args.dir {
        config.dir = dir;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max) = args.max_request_bytes {
        config.max_request_bytes = max;
    }
    if !args.databases.is_empty() {
        config.databases = args.databases;
    }

    config.validate()?;
    fluxion::server::run(config).await
}

fn install(args: InstallArgs) -> anyhow::Result<()> {
    let installed = install_archive(&args.dir, &args.archive)
        .with_context(|| format!("installing {}", args.archive.display()))?;
    println!(
        "installed module `{}` ({} files) into {}",
        installed.name,
        installed.files,
        installed.dir.display()
    );
    Ok(())
}
