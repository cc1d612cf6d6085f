//! Error types for certificate issuance and revocation.

use thiserror::Error;

/// Result type alias for sshca-core operations.
pub type Result<T> = std::result::Result<T, CaError>;

/// Errors that can occur while issuing, revoking or storing certificates.
#[derive(Error, Debug)]
pub enum CaError {
    /// The submitted public key is not valid authorized-key text.
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    /// The CA key could not produce a certificate.
    #[error("signing failed: {0}")]
    Signing(String),

    /// A revocation list could not be built, parsed or verified.
    #[error("krl error: {0}")]
    Krl(String),

    /// SSH wire encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The certificate store rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// No record exists for the given key id.
    #[error("certificate not found: {0}")]
    NotFound(String),

    /// The auth provider failed.
    #[error("auth provider error: {0}")]
    Provider(String),

    /// Key material could not be fetched.
    #[error("key source error: {0}")]
    KeySource(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaError {
    /// Returns true if the caller supplied bad input (4xx class).
    #[must_use]
    pub const fn is_input_error(&self) -> bool {
        matches!(self, Self::MalformedKey(_) | Self::NotFound(_))
    }

    /// HTTP status code that best describes this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::MalformedKey(_) => 400,
            Self::NotFound(_) => 404,
            Self::Provider(_) => 502,
            _ => 500,
        }
    }
}

impl From<ssh_encoding::Error> for CaError {
    fn from(e: ssh_encoding::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

impl From<ssh_key::Error> for CaError {
    fn from(e: ssh_key::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors() {
        assert!(CaError::MalformedKey("x".into()).is_input_error());
        assert!(!CaError::Signing("x".into()).is_input_error());
        assert_eq!(CaError::MalformedKey("x".into()).status_code(), 400);
        assert_eq!(CaError::Store("db down".into()).status_code(), 500);
    }

    #[test]
    fn test_display() {
        let err = CaError::Krl("bad magic".into());
        assert_eq!(err.to_string(), "krl error: bad magic");
    }

    #[test]
    fn test_key_errors_are_encoding_errors() {
        let err = CaError::from(ssh_key::Error::AlgorithmUnknown);
        assert!(matches!(err, CaError::Encoding(_)));
        assert_eq!(err.status_code(), 500);
    }
}
