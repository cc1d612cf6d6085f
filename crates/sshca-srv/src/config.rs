//! Server configuration for sshca.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use sshca_core::{Permissions, SignerPolicy};

use crate::error::SrvError;

/// Top-level server configuration, one table per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub ssh: SshConfig,
}

/// HTTP listener and browser session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP listen address (default: 127.0.0.1:8080).
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,

    /// Externally visible base URL, used for login links and CORS.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Mark session cookies `Secure`. Implied by `tls_cert`.
    #[serde(default)]
    pub use_tls: bool,

    /// PEM certificate chain; HTTPS is served when set together with `tls_key`.
    #[serde(default)]
    pub tls_cert: Option<String>,

    /// PEM private key for `tls_cert`.
    #[serde(default)]
    pub tls_key: Option<String>,

    /// HMAC key for session cookies.
    #[serde(default)]
    pub cookie_secret: String,

    /// HMAC key for CSRF tokens.
    #[serde(default)]
    pub csrf_secret: String,

    /// Refuse `/sign` requests that carry no reason message.
    #[serde(default)]
    pub require_reason: bool,
}

/// Identity provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Provider name (only `static` ships with the server).
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Provider-specific options.
    #[serde(default)]
    pub provider_opts: BTreeMap<String, String>,

    /// Usernames allowed to obtain certificates; empty allows everyone.
    #[serde(default)]
    pub users_whitelist: Vec<String>,

    /// How long an SSH login waits for its browser callback.
    #[serde(with = "humantime_serde", default = "default_callback_ttl")]
    pub callback_ttl: Duration,
}

/// Signing and SSH front end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Path of the CA private key.
    #[serde(default = "default_signing_key")]
    pub signing_key: String,

    /// Maximum certificate lifetime, e.g. `"24h"` or `"1h30m"`.
    #[serde(with = "humantime_serde", default = "default_max_age")]
    pub max_age: Duration,

    #[serde(default)]
    pub additional_principals: Vec<String>,

    /// `key=value` critical options and bare extensions.
    #[serde(default)]
    pub permissions: Vec<String>,

    /// SSH listen address; the SSH front end is off when unset.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Path of the SSH server host key.
    #[serde(default = "default_host_key")]
    pub host_key: String,

    /// Sign the KRL served at `/revoked`.
    #[serde(default)]
    pub sign_krl: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            public_url: default_public_url(),
            use_tls: false,
            tls_cert: None,
            tls_key: None,
            cookie_secret: String::new(),
            csrf_secret: String::new(),
            require_reason: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            provider_opts: BTreeMap::new(),
            users_whitelist: Vec::new(),
            callback_ttl: default_callback_ttl(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            signing_key: default_signing_key(),
            max_age: default_max_age(),
            additional_principals: Vec::new(),
            permissions: Vec::new(),
            listen: None,
            host_key: default_host_key(),
            sign_krl: false,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject configurations the server cannot safely start with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.cookie_secret.is_empty() {
            return Err(SrvError::Config("server.cookie_secret is empty".into()));
        }
        if self.server.csrf_secret.is_empty() {
            return Err(SrvError::Config("server.csrf_secret is empty".into()));
        }
        url::Url::parse(&self.server.public_url)
            .map_err(|e| SrvError::Config(format!("server.public_url: {e}")))?;
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(SrvError::Config(
                "server.tls_cert and server.tls_key must be set together".into(),
            ));
        }
        if self.ssh.max_age.is_zero() {
            return Err(SrvError::Config("ssh.max_age must be positive".into()));
        }
        if self.auth.callback_ttl.is_zero() {
            return Err(SrvError::Config("auth.callback_ttl must be positive".into()));
        }
        Ok(())
    }

    /// Whether HTTPS is terminated by this server.
    pub const fn serves_tls(&self) -> bool {
        self.server.tls_cert.is_some() && self.server.tls_key.is_some()
    }

    /// Whether browsers reach the server over HTTPS.
    pub const fn secure_cookies(&self) -> bool {
        self.server.use_tls || self.serves_tls()
    }

    /// `public_url` without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server.public_url.trim_end_matches('/')
    }

    /// Build the signing policy from the `[ssh]` table.
    pub fn signer_policy(&self) -> SignerPolicy {
        SignerPolicy {
            max_age: self.ssh.max_age,
            additional_principals: self.ssh.additional_principals.clone(),
            permissions: Permissions::parse(&self.ssh.permissions),
            sign_krl: self.ssh.sign_krl,
        }
    }
}

// Default value functions for serde.
fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_public_url() -> String {
    String::from("http://127.0.0.1:8080")
}

fn default_provider() -> String {
    String::from("static")
}

const fn default_callback_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_signing_key() -> String {
    String::from("signing_key")
}

const fn default_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_host_key() -> String {
    String::from("ssh_host_ed25519_key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.auth.provider, "static");
        assert_eq!(config.ssh.max_age, Duration::from_secs(86_400));
        assert_eq!(config.auth.callback_ttl, Duration::from_secs(600));
        assert!(config.ssh.listen.is_none());
        assert!(!config.serves_tls());
    }

    #[test]
    fn test_defaults_need_secrets() {
        assert!(matches!(
            ServerConfig::default().validate(),
            Err(SrvError::Config(_))
        ));
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
public_url = "https://ca.example.com/"
cookie_secret = "c"
csrf_secret = "x"
require_reason = true

[auth]
users_whitelist = ["alice"]

[ssh]
max_age = "1h30m"
additional_principals = ["ec2-user"]
permissions = ["force-command=/bin/true", "permit-pty"]
listen = "0.0.0.0:2222"
"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.base_url(), "https://ca.example.com");
        assert!(config.server.require_reason);
        assert_eq!(config.ssh.listen.unwrap().port(), 2222);

        let policy = config.signer_policy();
        assert_eq!(policy.max_age, Duration::from_secs(5400));
        assert_eq!(policy.additional_principals, ["ec2-user"]);
        assert_eq!(
            policy.permissions.critical_options["force-command"],
            "/bin/true"
        );
        assert!(policy.permissions.extensions.contains_key("permit-pty"));
    }

    #[test]
    fn test_bad_max_age() {
        let parsed = toml::from_str::<ServerConfig>("[ssh]\nmax_age = \"forever\"\n");
        assert!(parsed.is_err());

        let mut config = ServerConfig::default();
        config.server.cookie_secret = "c".into();
        config.server.csrf_secret = "x".into();
        config.ssh.max_age = Duration::ZERO;
        assert!(matches!(config.validate(), Err(SrvError::Config(_))));
    }

    #[test]
    fn test_compound_durations() {
        let config: ServerConfig =
            toml::from_str("[auth]\ncallback_ttl = \"2m 30s\"\n[ssh]\nmax_age = \"1d 12h\"\n")
                .unwrap();
        assert_eq!(config.auth.callback_ttl, Duration::from_secs(150));
        assert_eq!(config.ssh.max_age, Duration::from_secs(36 * 3600));
    }

    #[test]
    fn test_tls_pair_required() {
        let mut config = ServerConfig::default();
        config.server.cookie_secret = "c".into();
        config.server.csrf_secret = "x".into();
        config.server.tls_cert = Some("cert.pem".into());
        assert!(matches!(config.validate(), Err(SrvError::Config(_))));

        config.server.tls_key = Some("key.pem".into());
        config.validate().unwrap();
        assert!(config.serves_tls());
        assert!(config.secure_cookies());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/sshca.toml")).unwrap();
        assert_eq!(config.ssh.signing_key, "signing_key");
    }
}
