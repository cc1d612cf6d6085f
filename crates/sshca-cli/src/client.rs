//! Client for the CA's `/sign` endpoint.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client as HttpClient, StatusCode};
use ssh_key::Certificate;
use sshca_core::{keycodec, CaError, SignRequest, SignResponse};
use thiserror::Error;
use tracing::debug;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Header the CA sets when it wants a reason message.
pub const NEED_REASON_HEADER: &str = "x-need-reason";

/// Errors from a signing request.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The CA requires a justification message; retry with one.
    #[error("the CA requires a reason for this request")]
    NeedsReason,

    /// The token was missing, invalid or not allowed.
    #[error("unauthorized")]
    Unauthorized,

    /// The CA refused the request.
    #[error("CA error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Transport failure.
    #[error("http error: {0}")]
    Http(String),

    /// The returned certificate could not be parsed.
    #[error(transparent)]
    Core(#[from] CaError),
}

/// Signs public keys against one CA.
#[derive(Clone)]
pub struct SignClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: HttpClient,
    base_url: String,
}

impl std::fmt::Debug for SignClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignClient")
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

impl SignClient {
    /// Create a client for the CA at `base_url` with default settings.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        SignClientBuilder::new(base_url).build()
    }

    /// Create a builder for custom configuration
    #[must_use]
    pub fn builder(base_url: impl Into<String>) -> SignClientBuilder {
        SignClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Ask the CA to sign `request`, authenticating with `token`.
    pub async fn sign(
        &self,
        token: &str,
        request: &SignRequest,
    ) -> Result<Certificate, ClientError> {
        let url = format!("{}/sign", self.inner.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .inner
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN && response.headers().contains_key(NEED_REASON_HEADER) {
            return Err(ClientError::NeedsReason);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let reply: SignResponse = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(_) => {
                return Err(ClientError::Server {
                    status: status.as_u16(),
                    message: body,
                })
            }
        };
        if !status.is_success() || !reply.is_ok() {
            return Err(ClientError::Server {
                status: status.as_u16(),
                message: reply.response,
            });
        }
        Ok(keycodec::parse_certificate(&reply.response)?)
    }
}

/// Builder for configuring a [`SignClient`]
pub struct SignClientBuilder {
    base_url: String,
    timeout: Duration,
    user_agent: String,
}

impl SignClientBuilder {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: format!("sshca/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set the request timeout
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the User-Agent header
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Build the client
    pub fn build(self) -> Result<SignClient, ClientError> {
        let http = HttpClient::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;

        Ok(SignClient {
            inner: Arc::new(ClientInner {
                http,
                base_url: self.base_url,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, PrivateKey};
    use sshca_core::{KeySigner, SignerPolicy};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> (SignRequest, String) {
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let signer = KeySigner::new(ca, SignerPolicy::default()).unwrap();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let request = SignRequest::new(
            keycodec::marshal_public_key(key.public_key()).unwrap(),
            chrono::Utc::now() + chrono::Duration::hours(1),
        );
        let cert = signer.sign(&request, "alice").unwrap();
        (request, keycodec::marshal_certificate(&cert).unwrap())
    }

    #[tokio::test]
    async fn test_sign_success() {
        let server = MockServer::start().await;
        let (request, cert_text) = request();
        Mock::given(method("POST"))
            .and(path("/sign"))
            .and(header("authorization", "Bearer tok"))
            .and(body_partial_json(serde_json::json!({"key": request.key})))
            .respond_with(ResponseTemplate::new(200).set_body_json(SignResponse::ok(&cert_text)))
            .expect(1)
            .mount(&server)
            .await;

        let client = SignClient::new(format!("{}/", server.uri())).unwrap();
        let cert = client.sign("tok", &request).await.unwrap();
        assert_eq!(cert.valid_principals(), ["alice"]);
    }

    #[tokio::test]
    async fn test_needs_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("X-Need-Reason", "required")
                    .set_body_json(SignResponse::error("a reason is required")),
            )
            .mount(&server)
            .await;

        let client = SignClient::new(server.uri()).unwrap();
        let (request, _) = request();
        assert!(matches!(
            client.sign("tok", &request).await,
            Err(ClientError::NeedsReason)
        ));
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(SignResponse::error("Unauthorized: unauthorized")),
            )
            .mount(&server)
            .await;

        let client = SignClient::new(server.uri()).unwrap();
        let (request, _) = request();
        assert!(matches!(
            client.sign("tok", &request).await,
            Err(ClientError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_server_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(SignResponse::error("malformed public key: bad")),
            )
            .mount(&server)
            .await;

        let client = SignClient::new(server.uri()).unwrap();
        let (request, _) = request();
        match client.sign("tok", &request).await {
            Err(ClientError::Server { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "malformed public key: bad");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_certificate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(ResponseTemplate::new(200).set_body_json(SignResponse::ok("nonsense")))
            .mount(&server)
            .await;

        let client = SignClient::new(server.uri()).unwrap();
        let (request, _) = request();
        assert!(matches!(
            client.sign("tok", &request).await,
            Err(ClientError::Core(_))
        ));
    }
}
