//! Loading keys into the local ssh-agent.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ssh_key::{Certificate, PrivateKey};
use sshca_core::types::unix_to_utc;
use tracing::debug;

/// Environment variable naming the agent socket.
pub const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Agent comment for an issued certificate.
pub fn comment(cert: &Certificate) -> String {
    format!(
        "{} [Expires {}]",
        cert.key_id(),
        unix_to_utc(cert.valid_before()).to_rfc3339()
    )
}

/// Seconds until `expires`, clamped to what the agent protocol can carry.
pub fn lifetime_until(expires: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let secs = (expires - now).num_seconds().max(1);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Add `key` and `cert` to the agent named by `SSH_AUTH_SOCK`.
pub async fn install(key: &PrivateKey, cert: &Certificate) -> Result<()> {
    let Some(path) = std::env::var_os(AUTH_SOCK_ENV) else {
        bail!("{AUTH_SOCK_ENV} is not set, is ssh-agent running?");
    };
    install_at(std::path::Path::new(&path), key, cert).await
}

/// Add `key` and `cert` to the agent listening on `path`.
#[cfg(unix)]
pub async fn install_at(
    path: &std::path::Path,
    key: &PrivateKey,
    cert: &Certificate,
) -> Result<()> {
    use sshca_core::agent::{add_identity, AddIdentity};

    let mut stream = tokio::net::UnixStream::connect(path)
        .await
        .with_context(|| format!("connecting to ssh-agent at {}", path.display()))?;
    let identity = AddIdentity {
        key,
        certificate: Some(cert),
        comment: comment(cert),
        lifetime_secs: Some(lifetime_until(unix_to_utc(cert.valid_before()), Utc::now())),
    };
    add_identity(&mut stream, &identity)
        .await
        .context("adding identity to ssh-agent")?;
    debug!(key_id = %cert.key_id(), "identity added to agent");
    Ok(())
}

#[cfg(not(unix))]
pub async fn install_at(
    path: &std::path::Path,
    _key: &PrivateKey,
    _cert: &Certificate,
) -> Result<()> {
    bail!(
        "ssh-agent at {} is not reachable on this platform, use --key-file-prefix",
        path.display()
    )
}
