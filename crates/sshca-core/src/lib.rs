//! Core of the sshca SSH certificate authority.
//!
//! - **Signing**: [`KeySigner`] turns a public key and an authenticated
//!   username into a short-lived user certificate
//! - **Revocation**: [`Krl`] builds and parses OpenSSH key revocation lists
//! - **Collaborators**: [`CertStorer`], [`Provider`] and [`KeySource`] are the
//!   seams for storage, identity and key material
//!
//! # Example
//!
//! ```rust,ignore
//! use sshca_core::{KeySigner, SignRequest, SignerPolicy};
//!
//! let signer = KeySigner::from_openssh(ca_pem, SignerPolicy::default())?;
//! let cert = signer.sign(&SignRequest::new(pubkey, expiry), "alice")?;
//! println!("{}", sshca_core::keycodec::marshal_certificate(&cert)?);
//! ```

pub mod agent;
mod error;
pub mod keycodec;
pub mod keysource;
pub mod krl;
pub mod provider;
pub mod signer;
pub mod store;
pub mod types;

pub use error::{CaError, Result};
pub use keysource::{FileKeySource, KeySource};
pub use krl::Krl;
pub use provider::{AccessToken, Provider, StaticProvider};
pub use signer::{KeySigner, Permissions, SignerPolicy};
pub use store::{CertStorer, MemoryStore};
pub use types::{CertRecord, SignRequest, SignResponse};

/// Crate version, reported by the server in `X-Sshca-Version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
