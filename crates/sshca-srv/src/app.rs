//! Shared server context.

use std::sync::Arc;

use ssh_key::Certificate;
use sshca_core::{
    AccessToken, CertStorer, KeySigner, KeySource, MemoryStore, Provider, SignRequest,
    StaticProvider,
};
use tracing::{info, warn};

use crate::callback::CallbackCoordinator;
use crate::config::ServerConfig;
use crate::error::SrvError;
use crate::metrics::Metrics;
use crate::session::SessionKeys;

/// Everything the HTTP and SSH front ends share. Built once at startup.
pub struct App {
    pub config: ServerConfig,
    pub signer: KeySigner,
    pub store: Arc<dyn CertStorer>,
    pub provider: Arc<dyn Provider>,
    pub coordinator: Arc<CallbackCoordinator>,
    pub sessions: SessionKeys,
    pub metrics: Metrics,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("signer", &self.signer)
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl App {
    pub fn new(
        config: ServerConfig,
        signer: KeySigner,
        store: Arc<dyn CertStorer>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        let coordinator = Arc::new(CallbackCoordinator::new(config.auth.callback_ttl));
        let sessions = SessionKeys::new(
            &config.server.cookie_secret,
            &config.server.csrf_secret,
            config.secure_cookies(),
        );
        Self {
            config,
            signer,
            store,
            provider,
            coordinator,
            sessions,
            metrics: Metrics::new(),
        }
    }

    /// Validate the config, load the CA key and wire up collaborators.
    pub async fn from_config(config: ServerConfig, keys: &dyn KeySource) -> crate::Result<Self> {
        config.validate()?;
        let pem = keys
            .read(&config.ssh.signing_key)
            .await
            .map_err(|e| SrvError::Config(format!("signing key: {e}")))?;
        let signer = KeySigner::from_openssh(&pem, config.signer_policy())
            .map_err(|e| SrvError::Config(e.to_string()))?;
        let provider = build_provider(&config)?;
        info!(
            provider = provider.name(),
            ca = %signer.public_key().fingerprint(ssh_key::HashAlg::Sha256),
            "certificate authority ready"
        );
        Ok(Self::new(config, signer, Arc::new(MemoryStore::new()), provider))
    }

    /// Whether `token` is valid and its owner is allowed to get certificates.
    pub async fn authorized(&self, token: &AccessToken) -> bool {
        self.metrics.auth_valid.inc(self.provider.name());
        if !self.provider.valid(token).await {
            return false;
        }
        let whitelist = &self.config.auth.users_whitelist;
        if whitelist.is_empty() {
            return true;
        }
        match self.provider.username(token).await {
            Ok(user) => whitelist.iter().any(|u| *u == user),
            Err(e) => {
                warn!(error = %e, "username lookup failed");
                false
            }
        }
    }

    /// Sign a certificate for `username` and record it.
    ///
    /// Storage failures are logged; the certificate is still returned.
    pub async fn issue(
        &self,
        request: &SignRequest,
        username: &str,
    ) -> crate::Result<Certificate> {
        let cert = self.signer.sign(request, username)?;
        let record = sshca_core::CertRecord::from_certificate(&cert)
            .map(|r| r.with_message(request.message.clone()));
        let stored = match record {
            Ok(record) => self.store.set_record(record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            warn!(key_id = %cert.key_id(), error = %e, "failed to record certificate");
        }
        Ok(cert)
    }

    /// The current KRL built from revoked, unexpired records.
    pub async fn revocation_list(&self) -> crate::Result<Vec<u8>> {
        let revoked = self.store.get_revoked().await?;
        Ok(self.signer.generate_revocation_list(&revoked)?)
    }
}

/// Instantiate the configured identity provider.
pub fn build_provider(config: &ServerConfig) -> crate::Result<Arc<dyn Provider>> {
    match config.auth.provider.as_str() {
        "static" => {
            let username = config
                .auth
                .provider_opts
                .get("username")
                .ok_or_else(|| SrvError::Config("auth.provider_opts.username is required".into()))?;
            let callback = format!("{}/auth/callback", config.base_url());
            Ok(Arc::new(StaticProvider::new(username.clone(), callback)))
        }
        other => Err(SrvError::Config(format!("unknown auth provider {other:?}"))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, PrivateKey};
    use sshca_core::SignerPolicy;

    pub(crate) const TEST_TOKEN: &str = "test-token";

    pub(crate) async fn test_app(configure: impl FnOnce(&mut ServerConfig)) -> Arc<App> {
        let mut config = ServerConfig::default();
        config.server.cookie_secret = "cookie".into();
        config.server.csrf_secret = "csrf".into();
        config.server.public_url = "https://ca.example.com".into();
        config
            .auth
            .provider_opts
            .insert("username".into(), "alice".into());
        configure(&mut config);

        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let signer = KeySigner::new(ca, SignerPolicy::default()).unwrap();
        let provider = StaticProvider::new("alice", "https://ca.example.com/auth/callback");
        provider.insert_token(AccessToken::new(TEST_TOKEN)).await;

        let store = Arc::new(MemoryStore::new());
        Arc::new(App::new(config, signer, store, Arc::new(provider)))
    }

    #[tokio::test]
    async fn test_whitelist() {
        let token = AccessToken::new(TEST_TOKEN);

        let open = test_app(|_| {}).await;
        assert!(open.authorized(&token).await);
        assert!(!open.authorized(&AccessToken::new("bogus")).await);

        let allowed = test_app(|c| c.auth.users_whitelist = vec!["alice".into()]).await;
        assert!(allowed.authorized(&token).await);

        let denied = test_app(|c| c.auth.users_whitelist = vec!["bob".into()]).await;
        assert!(!denied.authorized(&token).await);
        assert_eq!(denied.metrics.auth_valid.get("static"), 1);
        assert_eq!(open.metrics.auth_valid.get("static"), 2);
    }

    #[tokio::test]
    async fn test_issue_records_certificate() {
        let app = test_app(|_| {}).await;
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let text = sshca_core::keycodec::marshal_public_key(key.public_key()).unwrap();
        let request = SignRequest::new(text, chrono::Utc::now() + chrono::Duration::hours(1))
            .with_message("deploy");

        let cert = app.issue(&request, "alice").await.unwrap();
        let record = app.store.get(cert.key_id()).await.unwrap();
        assert_eq!(record.principals, ["alice"]);
        assert_eq!(record.message, "deploy");
    }

    #[test]
    fn test_build_provider() {
        let mut config = ServerConfig::default();
        assert!(build_provider(&config).is_err());

        config
            .auth
            .provider_opts
            .insert("username".into(), "alice".into());
        assert_eq!(build_provider(&config).unwrap().name(), "static");

        config.auth.provider = "github".into();
        assert!(matches!(build_provider(&config), Err(SrvError::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config_reads_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let pem = ca.to_openssh(ssh_key::LineEnding::LF).unwrap();
        std::fs::write(dir.path().join("ca"), pem.as_bytes()).unwrap();

        let mut config = ServerConfig::default();
        config.server.cookie_secret = "cookie".into();
        config.server.csrf_secret = "csrf".into();
        config.ssh.signing_key = "ca".into();
        config
            .auth
            .provider_opts
            .insert("username".into(), "alice".into());

        let keys = sshca_core::FileKeySource::with_root(dir.path());
        let app = App::from_config(config.clone(), &keys).await.unwrap();
        assert_eq!(app.signer.public_key(), ca.public_key());

        config.ssh.signing_key = "missing".into();
        assert!(matches!(
            App::from_config(config, &keys).await,
            Err(SrvError::Config(_))
        ));
    }
}
