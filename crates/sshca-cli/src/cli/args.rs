//! Command-line argument definitions using clap.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::keys::KeyType;

/// Obtain a short-lived SSH certificate.
///
/// Opens the CA's login page in a browser, signs a freshly generated key
/// and loads key and certificate into the running ssh-agent.
#[derive(Parser, Debug)]
#[command(name = "sshca")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Base URL of the CA (or set SSHCA_URL env var)
    #[arg(long, env = "SSHCA_URL")]
    pub ca: Option<String>,

    // ========================================================================
    // Key options
    // ========================================================================
    /// Type of key to generate
    #[arg(short = 't', long, value_enum)]
    pub key_type: Option<KeyType>,

    /// Requested certificate validity, e.g. 8h or 1h30m
    #[arg(long, value_parser = humantime::parse_duration)]
    pub validity: Option<Duration>,

    /// Also write the key, public key and certificate with this prefix
    #[arg(short = 'f', long)]
    pub key_file_prefix: Option<PathBuf>,

    // ========================================================================
    // Login options
    // ========================================================================
    /// Print the login URL instead of opening a browser
    #[arg(long)]
    pub no_open: bool,

    /// Read the token from stdin instead of the local relay
    #[arg(long)]
    pub paste: bool,

    /// Increase verbosity
    #[arg(short, long)]
    pub verbose: bool,
}
