//! Interactive SSH front end.
//!
//! `ssh -A ca.example.com` drops the user into a short flow: they get a login
//! URL, finish the OAuth dance in a browser, and a fresh key plus certificate
//! is pushed into their forwarded agent. Nothing is ever written to disk on
//! either side.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, PrivateKey};
use sshca_core::agent::{self, AddIdentity};
use sshca_core::{keycodec, KeySource, SignRequest};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::error::SrvError;
use crate::session::random_hex;

/// Validity requested for certificates minted over SSH.
pub const SSH_CERT_VALIDITY: Duration = Duration::from_secs(9 * 60 * 60);

/// How long the forwarded agent keeps the injected identity.
pub const AGENT_LIFETIME_SECS: u32 = 24 * 60 * 60;

/// Comment attached to injected identities.
pub const AGENT_KEY_COMMENT: &str = "sshca-generated key";

/// Load the host key and build the russh server config.
pub async fn server_config(
    app: &App,
    keys: &dyn KeySource,
) -> crate::Result<russh::server::Config> {
    let pem = keys
        .read(&app.config.ssh.host_key)
        .await
        .map_err(|e| SrvError::Config(format!("ssh host key: {e}")))?;
    let host_key = russh::keys::PrivateKey::from_openssh(&pem)
        .map_err(|e| SrvError::Config(format!("ssh host key: {e}")))?;
    Ok(russh::server::Config {
        keys: vec![host_key],
        inactivity_timeout: Some(Duration::from_secs(15 * 60)),
        auth_rejection_time: Duration::from_secs(1),
        ..Default::default()
    })
}

/// Accept SSH connections on `addr` until `shutdown` resolves.
pub async fn serve(
    app: Arc<App>,
    config: russh::server::Config,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> crate::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| SrvError::Server(format!("SSH bind {addr}: {e}")))?;
    info!(addr = %addr, "SSH listener bound");

    let config = Arc::new(config);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "SSH accept failed");
                        continue;
                    }
                };
                let handler = SshHandler::new(app.clone(), peer);
                let config = config.clone();
                tokio::spawn(async move {
                    match russh::server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            if let Err(e) = session.await {
                                debug!(peer = %peer, error = %e, "SSH session ended with error");
                            }
                        }
                        Err(e) => debug!(peer = %peer, error = %e, "SSH handshake failed"),
                    }
                });
            }
            () = &mut shutdown => {
                info!("SSH listener stopping");
                return Ok(());
            }
        }
    }
}

/// Per-connection SSH state.
#[derive(Debug)]
pub struct SshHandler {
    app: Arc<App>,
    peer: SocketAddr,
    user: Option<String>,
    agent_forwarding: bool,
    started: bool,
}

impl SshHandler {
    pub fn new(app: Arc<App>, peer: SocketAddr) -> Self {
        Self {
            app,
            peer,
            user: None,
            agent_forwarding: false,
            started: false,
        }
    }
}

impl russh::server::Handler for SshHandler {
    type Error = SrvError;

    async fn auth_keyboard_interactive<'a>(
        &'a mut self,
        user: &str,
        _submethods: &str,
        _response: Option<russh::server::Response<'a>>,
    ) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "accepting keyboard-interactive login");
        self.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.agent_forwarding = true;
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        if self.started {
            return Ok(());
        }
        self.started = true;

        let flow = LoginFlow {
            app: self.app.clone(),
            term: ChannelTerminal {
                handle: session.handle(),
                channel,
            },
            peer: self.peer,
            user: self.user.clone().unwrap_or_default(),
            agent_forwarding: self.agent_forwarding,
        };
        tokio::spawn(async move { flow.finish().await });
        Ok(())
    }
}

/// A byte stream to the user's forwarded ssh-agent.
pub trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for T {}

/// The user's end of an SSH session.
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Write one line to the session.
    async fn say(&self, line: &str);

    /// Send EOF and close the session channel.
    async fn close(&self);

    /// Open a channel to the forwarded agent.
    async fn open_agent(&self) -> crate::Result<Box<dyn AgentStream>>;
}

/// [`Terminal`] backed by a russh session channel.
pub struct ChannelTerminal {
    handle: Handle,
    channel: ChannelId,
}

#[async_trait]
impl Terminal for ChannelTerminal {
    async fn say(&self, line: &str) {
        let text = format!("{line}\r\n");
        if self
            .handle
            .data(self.channel, CryptoVec::from(text.into_bytes()))
            .await
            .is_err()
        {
            debug!("terminal write failed, channel gone");
        }
    }

    async fn close(&self) {
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }

    async fn open_agent(&self) -> crate::Result<Box<dyn AgentStream>> {
        let channel = self
            .handle
            .channel_open_agent()
            .await
            .map_err(|e| SrvError::Agent(format!("unable to open agent channel: {e}")))?;
        Ok(Box::new(Box::pin(channel.into_stream())))
    }
}

/// One interactive login, driven from a spawned task.
struct LoginFlow<T> {
    app: Arc<App>,
    term: T,
    peer: SocketAddr,
    user: String,
    agent_forwarding: bool,
}

impl<T: Terminal> LoginFlow<T> {
    /// Run the login, report any failure to the user and close the session.
    async fn finish(&self) {
        if let Err(e) = self.run().await {
            self.app.metrics.errors.inc("ssh");
            warn!(peer = %self.peer, user = %self.user, error = %e, "SSH login failed");
            self.term.say(&format!("Error: {e}")).await;
        }
        self.term.close().await;
    }

    async fn run(&self) -> crate::Result<()> {
        self.term
            .say(&format!(
                "## Welcome to sshca, {}. This service issues short-lived SSH certificates.",
                self.user
            ))
            .await;
        if !self.agent_forwarding {
            return Err(SrvError::Agent(
                "agent forwarding is required, reconnect with `ssh -A`".into(),
            ));
        }

        let state = random_hex(32)?;
        let url = format!("{}/auth/login?state={state}", self.app.config.base_url());
        let wait = self.app.config.auth.callback_ttl;
        let rx = self
            .app
            .coordinator
            .register_session_with_ttl(&state, wait)
            .await;

        self.term.say(&format!("# Log In Here: {url}")).await;
        self.term
            .say("Waiting for the browser login to complete...")
            .await;

        let token = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(token)) => token,
            Ok(Err(_)) => return Err(SrvError::Server("login was cancelled".into())),
            Err(_) => {
                self.app.coordinator.unregister_session(&state).await;
                return Err(SrvError::Server("timed out waiting for login".into()));
            }
        };

        let oauth_user = self.app.provider.username(&token).await?;
        if oauth_user != self.user {
            return Err(SrvError::Server(format!(
                "logged in as {oauth_user:?} but connected over SSH as {:?}",
                self.user
            )));
        }

        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| SrvError::Server(format!("key generation failed: {e}")))?;
        let valid_until = Utc::now()
            + chrono::Duration::from_std(SSH_CERT_VALIDITY)
                .map_err(|e| SrvError::Server(e.to_string()))?;
        let public_key = keycodec::marshal_public_key(key.public_key())?;
        let cert = self
            .app
            .issue(&SignRequest::new(public_key, valid_until), &self.user)
            .await?;

        let mut stream = self.term.open_agent().await?;
        let identity = AddIdentity {
            key: &key,
            certificate: Some(&cert),
            comment: AGENT_KEY_COMMENT.to_string(),
            lifetime_secs: Some(AGENT_LIFETIME_SECS),
        };
        agent::add_identity(&mut stream, &identity)
            .await
            .map_err(|e| SrvError::Agent(e.to_string()))?;

        info!(user = %self.user, key_id = %cert.key_id(), "certificate added to forwarded agent");
        self.term
            .say(&format!(
                "Certificate {} added to your agent, valid until {}.",
                cert.key_id(),
                sshca_core::types::unix_to_utc(cert.valid_before()).to_rfc3339()
            ))
            .await;
        Ok(())
    }
}
