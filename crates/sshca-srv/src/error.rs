//! Error types for the sshca server.

use sshca_core::CaError;
use thiserror::Error;

/// Errors that can occur while starting or running the CA server.
#[derive(Error, Debug)]
pub enum SrvError {
    /// Configuration is invalid or missing required fields.
    #[error("config error: {0}")]
    Config(String),

    /// A listener failed to bind or the server loop failed.
    #[error("server error: {0}")]
    Server(String),

    /// SSH transport error.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// The forwarded ssh-agent refused or garbled a request.
    #[error("agent error: {0}")]
    Agent(String),

    /// Signing, revocation or collaborator failure.
    #[error(transparent)]
    Core(#[from] CaError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SrvError {
    /// Whether the failure is fatal at startup (bad config or key material).
    #[must_use]
    pub const fn is_startup_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Toml(_))
    }

    /// HTTP status code that best describes this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Core(e) => e.status_code(),
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_pass_through() {
        let err = SrvError::from(CaError::MalformedKey("bad".into()));
        assert_eq!(err.to_string(), "malformed public key: bad");
        assert!(!err.is_startup_error());
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_config_is_startup_error() {
        assert!(SrvError::Config("missing secret".into()).is_startup_error());
    }
}
