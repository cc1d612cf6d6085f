//! Server runner: binds HTTP (and optionally SSH) and serves until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sshca_core::KeySource;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::app::App;
use crate::config::{HttpConfig, ServerConfig};
use crate::error::SrvError;
use crate::{http, ssh};

/// How long open HTTP connections get to finish once shutdown starts.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Build the application from `config` and run every front end until ctrl-c.
pub async fn run(config: ServerConfig, keys: &dyn KeySource) -> crate::Result<()> {
    let tls = tls_config(&config.server, keys).await?;
    let app = Arc::new(App::from_config(config, keys).await?);

    let ssh_config = match app.config.ssh.listen {
        Some(addr) => Some((ssh::server_config(&app, keys).await?, addr)),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for ctrl-c");
            // Keep the sender alive so the server keeps running.
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    serve(app, tls, ssh_config, shutdown_rx).await
}

/// Load the HTTPS certificate chain and key when both are configured.
pub async fn tls_config(
    config: &HttpConfig,
    keys: &dyn KeySource,
) -> crate::Result<Option<RustlsConfig>> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert, &config.tls_key) else {
        return Ok(None);
    };
    let cert = keys
        .read(cert_path)
        .await
        .map_err(|e| SrvError::Config(format!("tls_cert: {e}")))?;
    let key = keys
        .read(key_path)
        .await
        .map_err(|e| SrvError::Config(format!("tls_key: {e}")))?;
    let server_config = rustls_server_config(&cert, &key)?;
    Ok(Some(RustlsConfig::from_config(Arc::new(server_config))))
}

fn rustls_server_config(cert_pem: &[u8], key_pem: &[u8]) -> crate::Result<rustls::ServerConfig> {
    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SrvError::Config(format!("tls_cert: {e}")))?;
    if chain.is_empty() {
        return Err(SrvError::Config("tls_cert: no certificates found".into()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| SrvError::Config(format!("tls_key: {e}")))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SrvError::Config(format!("TLS: {e}")))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| SrvError::Config(format!("TLS certificate: {e}")))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(server_config)
}

/// Run the HTTP and SSH listeners until `shutdown` flips to true.
///
/// HTTP is served over TLS when `tls` is set.
pub async fn serve(
    app: Arc<App>,
    tls: Option<RustlsConfig>,
    ssh_config: Option<(russh::server::Config, std::net::SocketAddr)>,
    shutdown: watch::Receiver<bool>,
) -> crate::Result<()> {
    app.coordinator.spawn_sweeper().await;

    let ssh_task = ssh_config.map(|(config, addr)| {
        let app = app.clone();
        let stop = wait_for(shutdown.clone());
        tokio::spawn(async move { ssh::serve(app, config, addr, stop).await })
    });

    let addr = app.config.server.listen;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| SrvError::Server(format!("HTTP bind {addr}: {e}")))?
        .into_std()
        .map_err(|e| SrvError::Server(format!("HTTP bind {addr}: {e}")))?;
    info!(
        addr = %addr,
        public_url = %app.config.base_url(),
        tls = tls.is_some(),
        "sshca HTTP server running"
    );

    let handle = axum_server::Handle::new();
    let stopper = handle.clone();
    let stop = wait_for(shutdown);
    tokio::spawn(async move {
        stop.await;
        stopper.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    });

    let make_service = http::router(app.clone()).into_make_service();
    let served = match tls {
        Some(tls) => {
            axum_server::from_tcp_rustls(listener, tls)
                .handle(handle)
                .serve(make_service)
                .await
        }
        None => {
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(make_service)
                .await
        }
    }
    .map_err(|e| SrvError::Server(format!("HTTP server error: {e}")));

    if let Some(task) = ssh_task {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "SSH server failed"),
            Err(e) => warn!(error = %e, "SSH server task panicked"),
            Ok(Ok(())) => {}
        }
    }

    app.coordinator.shutdown().await;
    if let Err(e) = app.store.close().await {
        warn!(error = %e, "failed to close certificate store");
    }
    info!("sshca stopped");
    served
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
