use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sshca_core::FileKeySource;
use sshca_srv::ServerConfig;
use tracing_subscriber::EnvFilter;

/// Short-lived SSH certificate authority server.
#[derive(Parser, Debug)]
#[command(name = "sshca-srv", version, about)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, env = "SSHCA_CONFIG", default_value = "sshca.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Relative key paths resolve against the config file's directory.
    let root = args
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    let keys = FileKeySource::with_root(root);

    sshca_srv::server::run(config, &keys).await?;
    Ok(())
}
