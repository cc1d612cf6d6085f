//! The login command: browser login, sign, install.

use anyhow::{Context as _, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use ssh_key::Certificate;
use sshca_core::types::unix_to_utc;
use sshca_core::{keycodec, SignRequest};
use tracing::{debug, warn};

use super::Context;
use crate::client::{ClientError, SignClient};
use crate::relay::{Relay, RESPONSE_OK};
use crate::{agent, keys};

/// Execute the login command.
pub async fn execute(ctx: Context) -> Result<()> {
    let client = SignClient::new(&ctx.ca)?;

    let mut relay = Relay::start(&ctx.ca).await?;
    let login_url = login_url(&ctx.ca, &relay.url())?;
    if ctx.open_browser && !ctx.paste {
        if let Err(e) = open::that(&login_url) {
            debug!(error = %e, "could not open a browser");
            eprintln!("Open this URL to log in:\n  {login_url}");
        }
    } else {
        eprintln!("Open this URL to log in:\n  {login_url}");
    }

    let token = if ctx.paste {
        eprintln!("Paste the token shown in the browser, then an empty line:");
        let text = read_stdin_block().await?;
        decode_pasted(&text)?
    } else {
        eprintln!("Waiting for the browser login...");
        relay
            .token()
            .await
            .context("relay closed before a token arrived")?
    };

    let key = keys::generate(ctx.key_type)?;
    let valid_until = Utc::now()
        + chrono::Duration::from_std(ctx.validity).context("validity out of range")?;
    let request = SignRequest::new(keycodec::marshal_public_key(key.public_key())?, valid_until);

    let signed = sign_with_reason(&client, &token, request, || async {
        eprintln!("The CA requires a reason for this certificate:");
        read_stdin_line().await
    })
    .await;

    match &signed {
        Ok(_) => relay.respond(RESPONSE_OK).await,
        Err(e) => relay.respond(&e.to_string()).await,
    }
    relay.shutdown().await;
    let cert = signed?;

    let mut installed = false;
    match agent::install(&key, &cert).await {
        Ok(()) => installed = true,
        Err(e) if ctx.key_file_prefix.is_some() => warn!(error = %e, "ssh-agent install failed"),
        Err(e) => return Err(e),
    }
    let files = match &ctx.key_file_prefix {
        Some(prefix) => Some(keys::write_key_files(prefix, &key, &cert)?),
        None => None,
    };

    println!("{}", summary(&cert));
    if installed {
        println!("  added to ssh-agent");
    }
    if let Some(files) = files {
        println!("  key:         {}", files.private.display());
        println!("  certificate: {}", files.certificate.display());
    }
    Ok(())
}

/// Landing page URL that hands the token to `relay_url`.
pub fn login_url(ca: &str, relay_url: &str) -> Result<String> {
    let mut url = url::Url::parse(&format!("{}/", ca.trim_end_matches('/')))
        .with_context(|| format!("invalid CA URL {ca:?}"))?;
    url.query_pairs_mut().append_pair("localserver", relay_url);
    Ok(url.into())
}

/// Decode a token pasted from the landing page, wrapped or not.
pub fn decode_pasted(text: &str) -> Result<String> {
    let joined: String = text.split_whitespace().collect();
    anyhow::ensure!(!joined.is_empty(), "no token was pasted");
    let raw = STANDARD.decode(joined).context("pasted token is not valid base64")?;
    String::from_utf8(raw).context("pasted token is not valid UTF-8")
}

/// Sign `request`, asking `reason` for a message once if the CA demands one.
pub async fn sign_with_reason<F, Fut>(
    client: &SignClient,
    token: &str,
    request: SignRequest,
    reason: F,
) -> Result<Certificate, ClientError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    match client.sign(token, &request).await {
        Err(ClientError::NeedsReason) => {
            let message = reason()
                .await
                .map_err(|e| ClientError::Http(format!("reading reason: {e}")))?;
            client.sign(token, &request.with_message(message)).await
        }
        other => other,
    }
}

/// One line summary of an issued certificate.
pub fn summary(cert: &Certificate) -> String {
    format!(
        "Certificate {} for {} valid until {}",
        cert.key_id(),
        cert.valid_principals().join(","),
        unix_to_utc(cert.valid_before()).to_rfc3339()
    )
}

async fn read_stdin_line() -> Result<String> {
    tokio::task::spawn_blocking(|| -> Result<String> {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line.trim().to_string())
    })
    .await?
}

async fn read_stdin_block() -> Result<String> {
    tokio::task::spawn_blocking(|| -> Result<String> {
        let mut text = String::new();
        for line in std::io::stdin().lines() {
            let line = line?;
            if line.trim().is_empty() {
                break;
            }
            text.push_str(&line);
            text.push('\n');
        }
        Ok(text)
    })
    .await?
}
