//! Signed browser sessions and CSRF tokens.
//!
//! Session state lives client side in a `session` cookie:
//! `base64url(json) "." hex(HMAC-SHA256)`. CSRF tokens are an HMAC of the
//! session id under a separate key.

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sshca_core::AccessToken;

use crate::error::SrvError;

/// Cookie name carrying the session.
pub const SESSION_COOKIE: &str = "session";

/// Session cookie lifetime in seconds.
pub const SESSION_MAX_AGE: u32 = 15 * 60;

/// Per-browser state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Random id; CSRF tokens are bound to it.
    pub id: String,

    /// OAuth state the browser is expected to come back with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Access token after a completed login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<AccessToken>,

    /// Where to go once logged in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
}

impl Session {
    pub fn new() -> crate::Result<Self> {
        Ok(Self {
            id: random_hex(16)?,
            ..Self::default()
        })
    }
}

/// HMAC keys for cookies and CSRF tokens.
pub struct SessionKeys {
    cookie: hmac::Key,
    csrf: hmac::Key,
    secure: bool,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn new(cookie_secret: &str, csrf_secret: &str, secure: bool) -> Self {
        Self {
            cookie: hmac::Key::new(hmac::HMAC_SHA256, cookie_secret.as_bytes()),
            csrf: hmac::Key::new(hmac::HMAC_SHA256, csrf_secret.as_bytes()),
            secure,
        }
    }

    /// Serialize and sign a session into a cookie value.
    pub fn encode(&self, session: &Session) -> crate::Result<String> {
        let json = serde_json::to_vec(session).map_err(sshca_core::CaError::from)?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let tag = hmac::sign(&self.cookie, payload.as_bytes());
        Ok(format!("{payload}.{}", hex::encode(tag.as_ref())))
    }

    /// Verify and deserialize a cookie value. Tampered values yield `None`.
    pub fn decode(&self, value: &str) -> Option<Session> {
        let (payload, tag) = value.rsplit_once('.')?;
        let tag = hex::decode(tag).ok()?;
        hmac::verify(&self.cookie, payload.as_bytes(), &tag).ok()?;
        let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&json).ok()
    }

    /// The session carried by the request, if any and if authentic.
    pub fn from_headers(&self, headers: &HeaderMap) -> Option<Session> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .and_then(|(_, value)| self.decode(value))
    }

    /// The session carried by the request, or a fresh one.
    pub fn load_or_new(&self, headers: &HeaderMap) -> crate::Result<Session> {
        match self.from_headers(headers) {
            Some(session) => Ok(session),
            None => Session::new(),
        }
    }

    /// A `Set-Cookie` header persisting `session`.
    pub fn set_cookie(
        &self,
        session: &Session,
    ) -> crate::Result<(axum::http::HeaderName, HeaderValue)> {
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; HttpOnly; Path=/; Max-Age={SESSION_MAX_AGE}; SameSite=Lax",
            self.encode(session)?
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        let value = HeaderValue::from_str(&cookie)
            .map_err(|e| SrvError::Server(format!("cookie header: {e}")))?;
        Ok((SET_COOKIE, value))
    }

    /// CSRF token bound to the session id.
    pub fn csrf_token(&self, session: &Session) -> String {
        hex::encode(hmac::sign(&self.csrf, session.id.as_bytes()).as_ref())
    }

    /// Constant-time check of a submitted CSRF token.
    pub fn verify_csrf(&self, session: &Session, token: &str) -> bool {
        hex::decode(token)
            .is_ok_and(|tag| hmac::verify(&self.csrf, session.id.as_bytes(), &tag).is_ok())
    }
}

/// `len` random bytes from the system CSPRNG, hex encoded.
pub fn random_hex(len: usize) -> crate::Result<String> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| SrvError::Server("system random source failed".into()))?;
    Ok(hex::encode(buf))
}
