//! Certificate signing engine.
//!
//! [`KeySigner`] turns an authenticated username and a client public key into
//! a user certificate under a fixed policy:
//!
//! - expiry is clamped to `now + max_age` (clients may only ask for less)
//! - `valid_after` is backdated by [`CLOCK_SKEW`]
//! - principals are `[username, additional principals...]`
//! - `key=value` permissions become critical options, anything else an
//!   extension flag; with no permissions configured [`DEFAULT_EXTENSIONS`]
//!   apply

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ssh_key::certificate::{Builder, CertType};
use ssh_key::public::KeyData;
use ssh_key::rand_core::{OsRng, RngCore};
use ssh_key::{Certificate, HashAlg, PrivateKey, PublicKey};
use tracing::{info, warn};

use crate::error::{CaError, Result};
use crate::keycodec;
use crate::krl::Krl;
use crate::types::{unix_to_utc, CertRecord, SignRequest};

/// How far `valid_after` is backdated to tolerate clients with fast clocks.
pub const CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Extensions granted when no permissions are configured.
pub const DEFAULT_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// Critical options and extensions stamped on every certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    pub critical_options: BTreeMap<String, String>,
    pub extensions: BTreeMap<String, String>,
}

impl Permissions {
    /// Parse configured permission strings.
    ///
    /// `"force-command=/bin/true"` becomes the critical option
    /// `force-command = "/bin/true"`; `"permit-pty"` becomes the extension
    /// `permit-pty = ""`. An empty list yields [`DEFAULT_EXTENSIONS`].
    pub fn parse<S: AsRef<str>>(perms: &[S]) -> Self {
        let mut parsed = Self::default();
        if perms.is_empty() {
            for ext in DEFAULT_EXTENSIONS {
                parsed.extensions.insert(ext.to_string(), String::new());
            }
            return parsed;
        }
        for perm in perms {
            let perm = perm.as_ref();
            match perm.split_once('=') {
                Some((key, value)) => {
                    parsed
                        .critical_options
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    parsed
                        .extensions
                        .insert(perm.trim().to_string(), String::new());
                }
            }
        }
        parsed
    }
}

/// Signing policy applied by a [`KeySigner`].
#[derive(Debug, Clone)]
pub struct SignerPolicy {
    /// Hard ceiling on certificate lifetime.
    pub max_age: Duration,
    /// Principals appended after the username.
    pub additional_principals: Vec<String>,
    pub permissions: Permissions,
    /// Sign the KRL served at `/revoked` with the CA key.
    pub sign_krl: bool,
}

impl Default for SignerPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            additional_principals: Vec::new(),
            permissions: Permissions::parse::<&str>(&[]),
            sign_krl: false,
        }
    }
}

/// Signs SSH user certificates with the CA key.
pub struct KeySigner {
    ca: PrivateKey,
    policy: SignerPolicy,
}

impl fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySigner")
            .field("ca", &self.ca.fingerprint(HashAlg::Sha256).to_string())
            .field("policy", &self.policy)
            .finish()
    }
}

impl KeySigner {
    /// Create a signer from an already parsed CA key.
    pub fn new(ca: PrivateKey, policy: SignerPolicy) -> Result<Self> {
        if ca.is_encrypted() {
            return Err(CaError::Signing("CA key is encrypted".into()));
        }
        Ok(Self { ca, policy })
    }

    /// Create a signer from OpenSSH private key text.
    pub fn from_openssh(pem: &[u8], policy: SignerPolicy) -> Result<Self> {
        let ca = PrivateKey::from_openssh(pem)
            .map_err(|e| CaError::Signing(format!("unable to parse CA key: {e}")))?;
        Self::new(ca, policy)
    }

    /// The CA public key, as hosts list it in `TrustedUserCAKeys`.
    pub fn public_key(&self) -> &PublicKey {
        self.ca.public_key()
    }

    pub fn policy(&self) -> &SignerPolicy {
        &self.policy
    }

    /// Sign `request.key` for `username`.
    pub fn sign(&self, request: &SignRequest, username: &str) -> Result<Certificate> {
        self.sign_at(request, username, Utc::now())
    }

    /// Sign as if the current time were `now`.
    pub fn sign_at(
        &self,
        request: &SignRequest,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Certificate> {
        let result = self.build(request, username, now);
        if let Err(e) = &result {
            warn!(
                username = %username,
                valid_until = ?request.valid_until,
                error = %e,
                "certificate signing failed"
            );
        }
        result
    }

    fn build(
        &self,
        request: &SignRequest,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Certificate> {
        if username.is_empty() {
            return Err(CaError::Signing("empty username".into()));
        }
        let subject = keycodec::parse_public_key(&request.key)?;

        let issued = unix(now);
        let valid_before = unix(self.expiry(request.valid_until, now));
        let mut valid_after = issued.saturating_sub(CLOCK_SKEW.as_secs());
        if valid_before <= valid_after {
            // Requested expiry is in the past: issue an already-expired cert.
            valid_after = valid_before.saturating_sub(1);
        }

        let key_id = format!("{username}_{issued}");
        let cert = self
            .assemble(subject.key_data(), &key_id, username, valid_after, valid_before)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        info!(
            key_id = %key_id,
            principals = ?cert.valid_principals(),
            fingerprint = %subject.fingerprint(HashAlg::Sha256),
            valid_until = %unix_to_utc(valid_before),
            "issued certificate"
        );
        Ok(cert)
    }

    fn assemble(
        &self,
        subject: &KeyData,
        key_id: &str,
        username: &str,
        valid_after: u64,
        valid_before: u64,
    ) -> ssh_key::Result<Certificate> {
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.clone(),
            valid_after,
            valid_before,
        )?;
        builder.serial(OsRng.next_u64())?;
        builder.cert_type(CertType::User)?;
        builder.key_id(key_id)?;
        builder.valid_principal(username)?;
        for principal in &self.policy.additional_principals {
            builder.valid_principal(principal.as_str())?;
        }
        for (name, data) in &self.policy.permissions.critical_options {
            builder.critical_option(name.as_str(), data.as_str())?;
        }
        for (name, data) in &self.policy.permissions.extensions {
            builder.extension(name.as_str(), data.as_str())?;
        }
        builder.sign(&self.ca)
    }

    /// Chosen expiry: the request, unless absent, pre-epoch or past the ceiling.
    fn expiry(&self, requested: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let ceiling = chrono::Duration::from_std(self.policy.max_age)
            .ok()
            .and_then(|age| now.checked_add_signed(age))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        match requested {
            Some(t) if t.timestamp() > 0 && t <= ceiling => t,
            _ => ceiling,
        }
    }

    /// Build the KRL listing every record's key id under this CA.
    pub fn generate_revocation_list(&self, revoked: &[CertRecord]) -> Result<Vec<u8>> {
        let mut krl = Krl::new().with_comment("sshca");
        krl.revoke_key_ids(
            self.ca.public_key().key_data(),
            revoked.iter().map(|r| r.key_id.clone()),
        );
        let signer = self.policy.sign_krl.then_some(&self.ca);
        krl.encode(signer)
    }
}

fn unix(t: DateTime<Utc>) -> u64 {
    u64::try_from(t.timestamp()).unwrap_or(0)
}
