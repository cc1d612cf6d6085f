//! CLI argument parsing and command dispatch.

pub mod args;
pub mod login;

use anyhow::{Context as _, Result};
use args::Cli;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::keys::KeyType;

/// Validity used when neither flag nor config sets one.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(24 * 3600);

/// Settings for one login, flags merged over the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub ca: String,
    pub key_type: KeyType,
    pub validity: Duration,
    pub key_file_prefix: Option<PathBuf>,
    pub open_browser: bool,
    pub paste: bool,
}

impl Context {
    /// Merge `cli` over `config`.
    pub fn merge(cli: Cli, config: Config) -> Result<Self> {
        let ca = cli
            .ca
            .or(config.ca)
            .context("no CA configured, pass --ca or set SSHCA_URL")?;
        url::Url::parse(&ca).with_context(|| format!("invalid CA URL {ca:?}"))?;

        let validity = cli.validity.or(config.validity).unwrap_or(DEFAULT_VALIDITY);
        anyhow::ensure!(!validity.is_zero(), "validity must be greater than zero");

        Ok(Self {
            ca: ca.trim_end_matches('/').to_string(),
            key_type: cli.key_type.or(config.key_type).unwrap_or_default(),
            validity,
            key_file_prefix: cli.key_file_prefix.or(config.key_file_prefix),
            open_browser: !cli.no_open,
            paste: cli.paste,
        })
    }
}

/// Run the CLI application.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = Config::load()?;

    let ctx = Context::merge(cli, config)?;
    login::execute(ctx).await
}
