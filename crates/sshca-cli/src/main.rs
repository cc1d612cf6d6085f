//! sshca - obtain a short-lived SSH certificate.
//!
//! Logs in through the browser, signs a fresh key and loads it into the
//! local ssh-agent.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sshca_cli::run().await
}
