//! OAuth identity providers.
//!
//! Signing logic depends only on the [`Provider`] capability surface. OAuth
//! backends (Google, GitHub, GitLab, ...) live outside this crate; the
//! [`StaticProvider`] here stands in for them in development and tests.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ssh_key::rand_core::{OsRng, RngCore};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::error::{CaError, Result};

/// An opaque provider access token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token. Never log this.
    pub fn secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// An OAuth identity provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &str;

    /// URL the browser is sent to in order to authenticate, carrying `state`.
    fn start_session(&self, state: &str) -> String;

    /// Exchange an authorization code for an access token.
    async fn exchange(&self, code: &str) -> Result<AccessToken>;

    /// Whether the token is currently valid.
    async fn valid(&self, token: &AccessToken) -> bool;

    /// The identity the token belongs to.
    async fn username(&self, token: &AccessToken) -> Result<String>;

    /// Invalidate the token.
    async fn revoke(&self, token: &AccessToken) -> Result<()>;
}

/// A provider that authenticates everyone as one fixed user.
///
/// `start_session` skips any real login page and points straight back at the
/// CA callback, so the full browser flow works without an OAuth backend.
/// Tokens are minted per exchange and die on revoke.
#[derive(Debug)]
pub struct StaticProvider {
    username: String,
    callback_url: String,
    tokens: Mutex<HashSet<AccessToken>>,
}

/// Authorization code the static provider hands back on its callback redirect.
pub const STATIC_CODE: &str = "static";

impl StaticProvider {
    pub fn new(username: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            callback_url: callback_url.into(),
            tokens: Mutex::new(HashSet::new()),
        }
    }

    /// Pre-register a token, as if it had been issued by [`Provider::exchange`].
    pub async fn insert_token(&self, token: AccessToken) {
        self.tokens.lock().await.insert(token);
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    fn start_session(&self, state: &str) -> String {
        match Url::parse(&self.callback_url) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair("state", state)
                    .append_pair("code", STATIC_CODE);
                url.into()
            }
            Err(_) => self.callback_url.clone(),
        }
    }

    async fn exchange(&self, code: &str) -> Result<AccessToken> {
        if code != STATIC_CODE {
            return Err(CaError::Provider(format!("unknown authorization code {code:?}")));
        }
        let mut raw = [0u8; 20];
        OsRng.fill_bytes(&mut raw);
        let token = AccessToken::new(hex::encode(raw));
        self.tokens.lock().await.insert(token.clone());
        debug!(provider = self.name(), "issued access token");
        Ok(token)
    }

    async fn valid(&self, token: &AccessToken) -> bool {
        self.tokens.lock().await.contains(token)
    }

    async fn username(&self, token: &AccessToken) -> Result<String> {
        if self.valid(token).await {
            Ok(self.username.clone())
        } else {
            Err(CaError::Provider("invalid token".into()))
        }
    }

    async fn revoke(&self, token: &AccessToken) -> Result<()> {
        self.tokens.lock().await.remove(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StaticProvider {
        StaticProvider::new("test", "https://ca.example.com/auth/callback")
    }

    #[test]
    fn test_start_session_redirects_to_callback() {
        let url = provider().start_session("abc123");
        assert_eq!(
            url,
            "https://ca.example.com/auth/callback?state=abc123&code=static"
        );
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let p = provider();
        let token = p.exchange(STATIC_CODE).await.unwrap();
        assert!(p.valid(&token).await);
        assert_eq!(p.username(&token).await.unwrap(), "test");

        p.revoke(&token).await.unwrap();
        assert!(!p.valid(&token).await);
        assert!(p.username(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_code() {
        assert!(matches!(
            provider().exchange("bogus").await,
            Err(CaError::Provider(_))
        ));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AccessToken::new("super-secret");
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}
