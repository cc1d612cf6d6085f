//! Loopback relay that receives the OAuth token from the browser.
//!
//! The CA's landing page posts the token to `http://127.0.0.1:{port}/{path}`.
//! The relay hands it to the CLI and holds the browser's request open until
//! the CLI reports how signing went, so the page can show the outcome.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a browser request waits for the CLI's verdict.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Verdict that makes the relay answer 200.
pub const RESPONSE_OK: &str = "ok";

struct RelayState {
    origin: HeaderValue,
    token_tx: mpsc::Sender<String>,
    response_rx: Mutex<mpsc::Receiver<String>>,
}

/// A running relay.
#[derive(Debug)]
pub struct Relay {
    addr: SocketAddr,
    path: String,
    token_rx: mpsc::Receiver<String>,
    response_tx: mpsc::Sender<String>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Relay {
    /// Bind `127.0.0.1:0` and accept tokens from pages served by `ca_url`.
    pub async fn start(ca_url: &str) -> Result<Self> {
        let mut raw = [0u8; 16];
        SystemRandom::new()
            .fill(&mut raw)
            .map_err(|_| anyhow::anyhow!("system random source failed"))?;
        let path = format!("/{}", hex::encode(raw));

        let origin = HeaderValue::from_str(ca_url.trim_end_matches('/'))
            .context("CA URL is not a valid header value")?;
        let (token_tx, token_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(1);
        let state = Arc::new(RelayState {
            origin,
            token_tx,
            response_rx: Mutex::new(response_rx),
        });

        let router = Router::new()
            .route(&path, post(receive_token).options(preflight))
            .with_state(state);

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .context("binding relay listener")?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "relay server failed");
            }
        });
        debug!(addr = %addr, "relay listening");

        Ok(Self {
            addr,
            path,
            token_rx,
            response_tx,
            shutdown_tx,
            task,
        })
    }

    /// URL the browser should post the token to.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), self.path)
    }

    /// Wait for the first token posted to the relay.
    pub async fn token(&mut self) -> Option<String> {
        self.token_rx.recv().await
    }

    /// Report the signing outcome to the waiting browser request.
    pub async fn respond(&self, result: &str) {
        if self.response_tx.send(result.to_string()).await.is_err() {
            debug!("no browser request waiting for the relay response");
        }
    }

    /// Stop serving. In-flight requests are released first.
    pub async fn shutdown(self) {
        let Self {
            response_tx,
            shutdown_tx,
            task,
            ..
        } = self;
        drop(response_tx);
        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "relay task failed");
        }
    }
}

fn with_cors(state: &RelayState, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, state.origin.clone());
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn preflight(State(state): State<Arc<RelayState>>) -> Response {
    with_cors(&state, StatusCode::OK)
}

async fn receive_token(State(state): State<Arc<RelayState>>, body: Bytes) -> Response {
    let token = url::form_urlencoded::parse(&body)
        .find(|(name, _)| name == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|t| !t.is_empty());
    let Some(token) = token else {
        return with_cors(&state, (StatusCode::UNAUTHORIZED, "missing token"));
    };

    let verdict = tokio::time::timeout(RESPONSE_TIMEOUT, async {
        state.token_tx.send(token).await.ok()?;
        state.response_rx.lock().await.recv().await
    })
    .await;

    match verdict {
        Ok(Some(result)) if result == RESPONSE_OK => with_cors(&state, (StatusCode::OK, result)),
        Ok(Some(result)) => with_cors(&state, (StatusCode::INTERNAL_SERVER_ERROR, result)),
        Ok(None) => with_cors(
            &state,
            (StatusCode::INTERNAL_SERVER_ERROR, "client went away"),
        ),
        Err(_) => with_cors(
            &state,
            (StatusCode::INTERNAL_SERVER_ERROR, "timed out waiting for the client"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn post_token(url: String, body: &'static str) -> reqwest::Response {
        reqwest::Client::new()
            .post(url)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_url_shape() {
        let relay = Relay::start("https://ca.example.com/").await.unwrap();
        let url = relay.url();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert_eq!(url::Url::parse(&url).unwrap().path().len(), 33);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_token() {
        let relay = Relay::start("https://ca.example.com/").await.unwrap();
        let response = post_token(relay.url(), "other=1").await;
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://ca.example.com"
        );
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_token_delivered_and_ok() {
        let mut relay = Relay::start("https://ca.example.com").await.unwrap();
        let browser = tokio::spawn(post_token(relay.url(), "token=abc123"));

        assert_eq!(relay.token().await.unwrap(), "abc123");
        relay.respond(RESPONSE_OK).await;

        let response = browser.await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_reported() {
        let mut relay = Relay::start("https://ca.example.com").await.unwrap();
        let browser = tokio::spawn(post_token(relay.url(), "token=abc123"));

        relay.token().await.unwrap();
        relay.respond("CA error (400): malformed public key").await;

        let response = browser.await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.text().await.unwrap(),
            "CA error (400): malformed public key"
        );
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_preflight() {
        let relay = Relay::start("https://ca.example.com/").await.unwrap();
        let response = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, relay.url())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://ca.example.com"
        );
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_request() {
        let mut relay = Relay::start("https://ca.example.com").await.unwrap();
        let browser = tokio::spawn(post_token(relay.url(), "token=abc123"));
        relay.token().await.unwrap();
        relay.shutdown().await;

        let response = browser.await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
