//! Key generation and on-disk key files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, Certificate, EcdsaCurve, LineEnding, PrivateKey};
use sshca_core::keycodec;
use tracing::debug;

/// Type of key to generate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Ed25519,
    /// ECDSA on NIST P-256.
    Ecdsa,
}

impl KeyType {
    pub fn algorithm(self) -> Algorithm {
        match self {
            Self::Ed25519 => Algorithm::Ed25519,
            Self::Ecdsa => Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        }
    }
}

/// Generate a fresh private key.
pub fn generate(key_type: KeyType) -> Result<PrivateKey> {
    PrivateKey::random(&mut OsRng, key_type.algorithm())
        .with_context(|| format!("generating {key_type:?} key"))
}

/// Paths of the three files written for a key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFiles {
    pub private: PathBuf,
    pub public: PathBuf,
    pub certificate: PathBuf,
}

impl KeyFiles {
    /// `{prefix}`, `{prefix}.pub` and `{prefix}-cert.pub`.
    pub fn for_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = prefix.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            private: prefix.to_path_buf(),
            public: with_suffix(".pub"),
            certificate: with_suffix("-cert.pub"),
        }
    }
}

/// Write the private key (mode 0600), public key and certificate.
pub fn write_key_files(prefix: &Path, key: &PrivateKey, cert: &Certificate) -> Result<KeyFiles> {
    let files = KeyFiles::for_prefix(prefix);
    if let Some(parent) = prefix.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let private = key.to_openssh(LineEnding::LF).context("encoding private key")?;
    write_private(&files.private, private.as_bytes())?;

    let public = keycodec::marshal_public_key(key.public_key())?;
    std::fs::write(&files.public, format!("{public}\n"))
        .with_context(|| format!("writing {}", files.public.display()))?;

    let cert_text = keycodec::marshal_certificate(cert)?;
    std::fs::write(&files.certificate, format!("{cert_text}\n"))
        .with_context(|| format!("writing {}", files.certificate.display()))?;

    debug!(prefix = %prefix.display(), "wrote key files");
    Ok(files)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("writing {}", path.display()))?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshca_core::{KeySigner, SignRequest, SignerPolicy};

    #[test]
    fn test_generate_key_types() {
        assert_eq!(
            generate(KeyType::Ed25519).unwrap().algorithm(),
            Algorithm::Ed25519
        );
        assert_eq!(
            generate(KeyType::Ecdsa).unwrap().algorithm(),
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256
            }
        );
    }

    #[test]
    fn test_key_file_names() {
        let files = KeyFiles::for_prefix(Path::new("/tmp/id_sshca"));
        assert_eq!(files.private, Path::new("/tmp/id_sshca"));
        assert_eq!(files.public, Path::new("/tmp/id_sshca.pub"));
        assert_eq!(files.certificate, Path::new("/tmp/id_sshca-cert.pub"));
    }

    #[test]
    fn test_write_key_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let signer = KeySigner::new(ca, SignerPolicy::default()).unwrap();
        let key = generate(KeyType::Ed25519).unwrap();
        let request = SignRequest::new(
            keycodec::marshal_public_key(key.public_key()).unwrap(),
            chrono::Utc::now() + chrono::Duration::hours(1),
        );
        let cert = signer.sign(&request, "alice").unwrap();

        let files = write_key_files(&dir.path().join("keys/id_sshca"), &key, &cert).unwrap();

        let private = std::fs::read(&files.private).unwrap();
        assert_eq!(
            PrivateKey::from_openssh(&private).unwrap().public_key().key_data(),
            key.public_key().key_data()
        );
        let cert_text = std::fs::read_to_string(&files.certificate).unwrap();
        assert_eq!(
            keycodec::parse_certificate(&cert_text).unwrap().key_id(),
            cert.key_id()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&files.private).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
