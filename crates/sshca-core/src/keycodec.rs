//! Authorized-key text encoding for public keys and certificates.
//!
//! Keys travel as a single line: `<algorithm> <base64 blob> [comment]`. The
//! marshalled form never carries a trailing newline.

use ssh_key::{Certificate, PublicKey};

use crate::error::{CaError, Result};

/// Parse a public key from authorized-key text.
pub fn parse_public_key(text: &str) -> Result<PublicKey> {
    let line = text.trim();
    if line.is_empty() {
        return Err(CaError::MalformedKey("empty key".into()));
    }
    PublicKey::from_openssh(line).map_err(|e| CaError::MalformedKey(e.to_string()))
}

/// Serialize a public key to authorized-key text.
pub fn marshal_public_key(key: &PublicKey) -> Result<String> {
    key.to_openssh()
        .map(|s| s.trim_end().to_string())
        .map_err(|e| CaError::Encoding(e.to_string()))
}

/// Parse a certificate from authorized-key text.
pub fn parse_certificate(text: &str) -> Result<Certificate> {
    Certificate::from_openssh(text.trim()).map_err(|e| CaError::MalformedKey(e.to_string()))
}

/// Serialize a certificate to authorized-key text.
pub fn marshal_certificate(cert: &Certificate) -> Result<String> {
    cert.to_openssh()
        .map(|s| s.trim_end().to_string())
        .map_err(|e| CaError::Encoding(e.to_string()))
}
