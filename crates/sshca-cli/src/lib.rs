//! # sshca-cli
//!
//! Client for the sshca certificate authority.
//!
//! ## Flow
//!
//! - **Login**: a loopback [`relay`] receives the OAuth token from the browser
//! - **Sign**: a fresh key is generated and signed through the [`client`]
//! - **Install**: key and certificate go to the local ssh-agent and,
//!   optionally, to disk via [`keys`]

pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod keys;
pub mod relay;

pub use cli::run;
