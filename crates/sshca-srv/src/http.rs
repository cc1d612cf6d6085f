//! HTTP front end: signing API, KRL, browser login and admin pages.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::map_response_with_state;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use sshca_core::keycodec;
use sshca_core::{AccessToken, CertRecord, SignRequest, SignResponse};
use tower::util::MapResponseLayer;
use tracing::{debug, info, instrument, warn};

use crate::app::App;
use crate::error::SrvError;
use crate::metrics;
use crate::session::{random_hex, Session};

/// Response header carrying the server version.
pub const VERSION_HEADER: &str = "x-sshca-version";

/// Response header telling the client a reason message is required.
pub const NEED_REASON_HEADER: &str = "x-need-reason";

/// Response header carrying the admin CSRF token.
pub const CSRF_HEADER: &str = "x-csrf-token";

const UNAUTHORIZED: &str = "Unauthorized: unauthorized";

/// Where a login started by a form post returns to.
const ADMIN_HOME: &str = "/admin/certs";

/// Build the router for every HTTP endpoint.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/sign", post(sign))
        .route("/revoked", get(revoked))
        .route("/ca", get(ca))
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(render_metrics))
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/admin/certs", get(list_certs))
        .route("/admin/certs.json", get(list_certs_json))
        .route("/admin/revoke", post(revoke))
        .layer(map_response_with_state(app.clone(), count_errors))
        .with_state(app)
        .layer(MapResponseLayer::new(stamp_version))
}

fn stamp_version(mut response: Response) -> Response {
    response.headers_mut().insert(
        HeaderName::from_static(VERSION_HEADER),
        HeaderValue::from_static(sshca_core::VERSION),
    );
    response
}

async fn count_errors(State(app): State<Arc<App>>, response: Response) -> Response {
    if response.status().is_server_error() {
        app.metrics.errors.inc("http");
    }
    response
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(SignResponse::error(message))).into_response()
}

fn error_response(err: &SrvError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_error(status, err.to_string())
}

/// A 302 redirect, optionally persisting the session.
fn found(app: &App, location: &str, session: Option<&Session>) -> Response {
    redirect(app, StatusCode::FOUND, location, session)
}

fn redirect(app: &App, status: StatusCode, location: &str, session: Option<&Session>) -> Response {
    let Ok(location) = HeaderValue::from_str(location) else {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid redirect target");
    };
    let mut response = (status, [(LOCATION, location)]).into_response();
    if let Some(session) = session {
        match app.sessions.set_cookie(session) {
            Ok((name, value)) => {
                response.headers_mut().insert(name, value);
            }
            Err(e) => return error_response(&e),
        }
    }
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<AccessToken> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| AccessToken::new(token))
}

#[instrument(skip_all)]
async fn sign(State(app): State<Arc<App>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return json_error(StatusCode::UNAUTHORIZED, UNAUTHORIZED);
    };
    if !app.authorized(&token).await {
        return json_error(StatusCode::UNAUTHORIZED, UNAUTHORIZED);
    }

    let request: SignRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid request: {e}")),
    };

    if app.config.server.require_reason && request.message.trim().is_empty() {
        let mut response = json_error(StatusCode::FORBIDDEN, "a reason is required");
        response.headers_mut().insert(
            HeaderName::from_static(NEED_REASON_HEADER),
            HeaderValue::from_static("required"),
        );
        return response;
    }

    let username = match app.provider.username(&token).await {
        Ok(username) => username,
        Err(e) => return error_response(&SrvError::from(e)),
    };

    let issued = app.issue(&request, &username).await;

    if let Err(e) = app.provider.revoke(&token).await {
        warn!(error = %e, "failed to revoke access token");
    }

    match issued.and_then(|cert| keycodec::marshal_certificate(&cert).map_err(SrvError::from)) {
        Ok(text) => (StatusCode::OK, Json(SignResponse::ok(text))).into_response(),
        Err(e) => error_response(&e),
    }
}

#[instrument(skip_all)]
async fn revoked(State(app): State<Arc<App>>) -> Response {
    match app.revocation_list().await {
        Ok(krl) => (
            [(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
            krl,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to build revocation list");
            error_response(&e)
        }
    }
}

async fn ca(State(app): State<Arc<App>>) -> Response {
    match keycodec::marshal_public_key(app.signer.public_key()) {
        Ok(text) => format!("{text}\n").into_response(),
        Err(e) => error_response(&SrvError::from(e)),
    }
}

async fn healthcheck() -> &'static str {
    "ok"
}

async fn render_metrics(State(app): State<Arc<App>>) -> Response {
    (
        [(CONTENT_TYPE, HeaderValue::from_static(metrics::CONTENT_TYPE))],
        app.metrics.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    #[serde(default)]
    state: Option<String>,
}

#[instrument(skip_all)]
async fn login(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
) -> Response {
    let state = match query.state.filter(|s| !s.is_empty()) {
        Some(state) => state,
        None => match random_hex(32) {
            Ok(state) => state,
            Err(e) => return error_response(&e),
        },
    };
    let mut session = match app.sessions.load_or_new(&headers) {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };
    session.state = Some(state.clone());
    debug!(provider = app.provider.name(), "starting login");
    found(&app, &app.provider.start_session(&state), Some(&session))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    state: String,
    code: String,
}

#[instrument(skip_all)]
async fn callback(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(mut session) = app.sessions.from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "no login in progress").into_response();
    };
    if session.state.as_deref() != Some(query.state.as_str()) {
        return (StatusCode::UNAUTHORIZED, "state mismatch").into_response();
    }
    session.state = None;

    app.metrics.auth_exchange.inc(app.provider.name());
    let token = match app.provider.exchange(&query.code).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "code exchange failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "login failed").into_response();
        }
    };
    if !app.authorized(&token).await {
        return (StatusCode::UNAUTHORIZED, "not authorized").into_response();
    }

    if app.coordinator.handle_callback(&query.state, token.clone()).await {
        info!("login delivered to ssh session");
        let mut response = Html(page(
            "Logged in",
            "<p>You may now close this window and return to your terminal.</p>",
        ))
        .into_response();
        if let Ok((name, value)) = app.sessions.set_cookie(&session) {
            response.headers_mut().insert(name, value);
        }
        return response;
    }

    session.token = Some(token);
    let origin = session.origin_url.take().unwrap_or_else(|| "/".to_string());
    found(&app, &origin, Some(&session))
}

/// The logged-in session, or a redirect to the login page.
///
/// A GET comes back to `uri` after login. Anything else comes back to the
/// admin listing.
async fn require_login(
    app: &App,
    headers: &HeaderMap,
    method: &Method,
    uri: &Uri,
) -> Result<Session, Response> {
    let mut session = app
        .sessions
        .load_or_new(headers)
        .map_err(|e| error_response(&e))?;
    if let Some(token) = &session.token {
        if app.authorized(token).await {
            return Ok(session);
        }
    }
    session.token = None;
    session.origin_url = if *method == Method::GET {
        uri.path_and_query().map(ToString::to_string)
    } else {
        Some(ADMIN_HOME.to_string())
    };
    Err(redirect(app, StatusCode::SEE_OTHER, "/auth/login", Some(&session)))
}

#[derive(Debug, Deserialize)]
struct IndexQuery {
    #[serde(default)]
    localserver: Option<String>,
}

#[instrument(skip_all)]
async fn index(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Query(query): Query<IndexQuery>,
) -> Response {
    let session = match require_login(&app, &headers, &method, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(token) = session.token.as_ref() else {
        return (StatusCode::UNAUTHORIZED, "not logged in").into_response();
    };

    let encoded = STANDARD.encode(token.secret());
    let wrapped: Vec<&str> = encoded
        .as_bytes()
        .chunks(70)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();

    let mut body = String::new();
    if let Some(target) = query.localserver.filter(|s| !s.is_empty()) {
        if !is_loopback_url(&target) {
            return (StatusCode::BAD_REQUEST, "localserver must be a loopback URL").into_response();
        }
        let _ = write!(
            body,
            concat!(
                r#"<form method="post" action="{}">"#,
                r#"<input type="hidden" name="token" value="{}">"#,
                r#"<button type="submit">Send to sshca</button></form>"#,
            ),
            escape_html(&target),
            escape_html(token.secret()),
        );
    }
    let _ = write!(
        body,
        "<p>Paste this token into the sshca client:</p><pre>{}</pre>",
        wrapped.join("\n")
    );
    Html(page("sshca", &body)).into_response()
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    all: bool,
}

#[instrument(skip_all)]
async fn list_certs(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Query(query): Query<ListQuery>,
) -> Response {
    let session = match require_login(&app, &headers, &method, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let records = match app.store.list(query.all).await {
        Ok(records) => records,
        Err(e) => return error_response(&SrvError::from(e)),
    };
    let csrf = app.sessions.csrf_token(&session);

    let mut rows = String::new();
    for record in &records {
        let _ = write!(
            rows,
            concat!(
                r#"<tr><td><input type="checkbox" name="cert_id" value="{id}"></td>"#,
                "<td>{id}</td><td>{principals}</td><td>{created}</td>",
                "<td>{expires}</td><td>{revoked}</td><td>{message}</td></tr>",
            ),
            id = escape_html(&record.key_id),
            principals = escape_html(&record.principals.join(", ")),
            created = record.created_at.to_rfc3339(),
            expires = record.expires.to_rfc3339(),
            revoked = record.revoked,
            message = escape_html(&record.message),
        );
    }
    let body = format!(
        concat!(
            r#"<form method="post" action="/admin/revoke">"#,
            r#"<input type="hidden" name="csrf_token" value="{csrf}">"#,
            "<table><tr><th></th><th>Key ID</th><th>Principals</th><th>Created</th>",
            "<th>Expires</th><th>Revoked</th><th>Reason</th></tr>{rows}</table>",
            r#"<button type="submit">Revoke</button></form>"#,
        ),
        csrf = csrf,
        rows = rows,
    );

    let mut response = Html(page("Issued certificates", &body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&csrf) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CSRF_HEADER), value);
    }
    response
}

#[instrument(skip_all)]
async fn list_certs_json(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(response) = require_login(&app, &headers, &method, &uri).await {
        return response;
    }
    match app.store.list(query.all).await {
        Ok(records) => Json::<Vec<CertRecord>>(records).into_response(),
        Err(e) => error_response(&SrvError::from(e)),
    }
}

#[instrument(skip_all)]
async fn revoke(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let session = match require_login(&app, &headers, &method, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let mut ids = Vec::new();
    let mut csrf = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    for (name, value) in url::form_urlencoded::parse(&body) {
        match name.as_ref() {
            "cert_id" => ids.push(value.into_owned()),
            "csrf_token" => csrf = Some(value.into_owned()),
            _ => {}
        }
    }

    if !csrf.is_some_and(|token| app.sessions.verify_csrf(&session, &token)) {
        return (StatusCode::FORBIDDEN, "invalid CSRF token").into_response();
    }

    if let Err(e) = app.store.revoke(&ids).await {
        return error_response(&SrvError::from(e));
    }
    info!(count = ids.len(), key_ids = ?ids, "revoked certificates");
    redirect(&app, StatusCode::SEE_OTHER, ADMIN_HOME, None)
}

fn is_loopback_url(target: &str) -> bool {
    url::Url::parse(target).is_ok_and(|u| {
        u.scheme() == "http"
            && match u.host() {
                Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
                Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
                Some(url::Host::Domain(d)) => d == "localhost",
                None => false,
            }
    })
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        concat!(
            r#"<!DOCTYPE html><html><head><meta charset="utf-8">"#,
            "<title>{title}</title></head><body><h1>{title}</h1>{body}</body></html>",
        ),
        title = escape_html(title),
        body = body,
    )
}
