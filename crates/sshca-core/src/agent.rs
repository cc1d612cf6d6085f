//! ssh-agent add-identity messages.
//!
//! Only the requests needed to hand a freshly minted key and its certificate
//! to an agent are built here; the transport (a forwarded agent channel or
//! `SSH_AUTH_SOCK`) belongs to the caller. Every message is framed as
//! `uint32 length || byte type || payload`.

use ssh_encoding::{Decode, Encode};
use ssh_key::private::KeypairData;
use ssh_key::{Certificate, Mpint, PrivateKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{CaError, Result};

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH2_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH2_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
pub const SSH_AGENT_CONSTRAIN_LIFETIME: u8 = 1;

/// Largest reply we accept from an agent.
pub const MAX_REPLY_LEN: u32 = 256 * 1024;

/// An identity to add: a private key, optionally with its certificate.
#[derive(Debug)]
pub struct AddIdentity<'a> {
    pub key: &'a PrivateKey,
    pub certificate: Option<&'a Certificate>,
    pub comment: String,
    /// Seconds until the agent drops the identity.
    pub lifetime_secs: Option<u32>,
}

impl AddIdentity<'_> {
    /// Encode the framed request.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let kind = if self.lifetime_secs.is_some() {
            SSH2_AGENTC_ADD_ID_CONSTRAINED
        } else {
            SSH2_AGENTC_ADD_IDENTITY
        };
        kind.encode(&mut body)?;

        match self.certificate {
            Some(cert) => {
                let cert_type = cert.algorithm().to_certificate_type();
                cert_type.as_str().encode(&mut body)?;
                let mut blob = Vec::new();
                cert.encode(&mut blob)?;
                blob.encode(&mut body)?;
                encode_cert_private(self.key.key_data(), &mut body)?;
            }
            None => {
                self.key.key_data().encode(&mut body)?;
            }
        }

        self.comment.as_str().encode(&mut body)?;

        if let Some(secs) = self.lifetime_secs {
            SSH_AGENT_CONSTRAIN_LIFETIME.encode(&mut body)?;
            secs.encode(&mut body)?;
        }

        let mut framed = Vec::with_capacity(body.len() + 4);
        body.encode(&mut framed)?;
        Ok(framed)
    }
}

// Private half of a certificate identity, per draft-miller-ssh-agent.
fn encode_cert_private(key: &KeypairData, out: &mut Vec<u8>) -> Result<()> {
    if let Some(ed25519) = key.ed25519() {
        ed25519.encode(out)?;
        return Ok(());
    }
    if let Some(ecdsa) = key.ecdsa() {
        Mpint::from_positive_bytes(ecdsa.private_key_bytes())?.encode(out)?;
        return Ok(());
    }
    Err(CaError::Encoding(format!(
        "unsupported agent key type {:?}",
        key.algorithm().ok()
    )))
}

/// Interpret a framed agent reply (without the length prefix).
pub fn check_reply(reply: &[u8]) -> Result<()> {
    let mut reader = reply;
    match u8::decode(&mut reader)? {
        SSH_AGENT_SUCCESS => Ok(()),
        SSH_AGENT_FAILURE => Err(CaError::Encoding("agent refused the key".into())),
        other => Err(CaError::Encoding(format!("unexpected agent reply {other}"))),
    }
}

/// Parse the big-endian length prefix of an agent reply.
pub fn reply_len(header: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(header);
    if len == 0 || len > MAX_REPLY_LEN {
        return Err(CaError::Encoding(format!("bad agent reply length {len}")));
    }
    usize::try_from(len).map_err(|e| CaError::Encoding(e.to_string()))
}

/// Send `identity` over an agent connection and wait for the verdict.
pub async fn add_identity<S>(stream: &mut S, identity: &AddIdentity<'_>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&identity.encode()?).await?;
    stream.flush().await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let mut reply = vec![0u8; reply_len(header)?];
    stream.read_exact(&mut reply).await?;
    check_reply(&reply)?;
    debug!(comment = %identity.comment, "agent accepted identity");
    Ok(())
}
