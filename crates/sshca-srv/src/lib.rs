//! sshca-srv: HTTP and SSH front ends for a short-lived SSH certificate authority.
//!
//! # Flows
//!
//! - **HTTP**: a client posts its public key to `/sign` with an OAuth bearer
//!   token and gets a certificate back
//! - **SSH**: `ssh -A` into the server, log in through the printed URL, and a
//!   fresh key and certificate land in the forwarded agent
//!
//! Both flows share one [`App`]: the signer, certificate store, identity
//! provider and the [`CallbackCoordinator`] pairing browser callbacks with
//! waiting SSH sessions.

pub mod app;
pub mod callback;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod server;
pub mod session;
pub mod ssh;

// Re-exports for convenience.
pub use app::App;
pub use callback::CallbackCoordinator;
pub use config::ServerConfig;
pub use error::SrvError;

/// Result type for sshca-srv operations.
pub type Result<T> = std::result::Result<T, SrvError>;
