//! Token proxy
//!
//! Holds the OAuth2 client credentials of an identity manager so callers only
//! need a username and password. `/token` turns the caller's credentials (or
//! a refresh token) into a password or refresh grant; `/revoke` forwards a
//! revocation. Both are POSTed to the IdM with the client's Basic auth.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, Uri},
    response::Response,
    routing::any,
    Router,
};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use url::{form_urlencoded, Url};

use ngsi_core::error::stage_message;
use ngsi_core::{
    HttpTransport, NgsiError, NgsiResult, OutboundRequest, Outcome, ProxyStats, UpstreamResponse,
};

use crate::common::{self, error_response};
use crate::form::{self, APPLICATION_JSON, FORM_URLENCODED};
use crate::ListenConfig;

const SERVER_STAGE: &str = "tokenProxy";
const HANDLER_STAGE: &str = "tokenProxyHandler";
const REQUEST_STAGE: &str = "tokeProxyRequestToken";
const REVOKE_STAGE: &str = "tokenProxyRevokeToken";

const TOKEN_PATH: &str = "/oauth2/token";

/// Token proxy configuration
#[derive(Debug, Clone, Default)]
pub struct TokenProxyConfig {
    pub idm_host: String,
    pub client_id: String,
    pub client_secret: String,
    /// Log passwords and upstream responses
    pub verbose: bool,
}

/// Shared token proxy state
pub struct TokenProxyState {
    token_url: Url,
    revoke_url: Url,
    client_id: String,
    client_secret: String,
    authorization: String,
    verbose: bool,
    transport: Arc<dyn HttpTransport>,
    stats: ProxyStats,
}

impl TokenProxyState {
    pub fn new(config: &TokenProxyConfig, transport: Arc<dyn HttpTransport>) -> NgsiResult<Self> {
        let (token_url, revoke_url) = idm_urls(&config.idm_host)?;
        let credentials = format!("{}:{}", config.client_id, config.client_secret);

        Ok(Self {
            token_url,
            revoke_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            authorization: format!("Basic {}", URL_SAFE.encode(credentials)),
            verbose: config.verbose,
            transport,
            stats: ProxyStats::new(),
        })
    }

    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    pub fn revoke_url(&self) -> &Url {
        &self.revoke_url
    }

    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }
}

/// Token endpoint and the sibling revoke endpoint of an IdM host
fn idm_urls(idm_host: &str) -> NgsiResult<(Url, Url)> {
    let mut token_url =
        Url::parse(idm_host).map_err(|e| NgsiError::with_source(SERVER_STAGE, 3, e))?;
    if !token_url.path().ends_with(TOKEN_PATH) {
        let path = format!("{}{}", token_url.path().trim_end_matches('/'), TOKEN_PATH);
        token_url.set_path(&path);
    }

    let mut revoke_url = token_url.clone();
    let base = token_url.path().trim_end_matches("/token");
    revoke_url.set_path(&format!("{}/revoke", base));

    Ok((token_url, revoke_url))
}

/// Token proxy server
pub struct TokenProxy {
    state: Arc<TokenProxyState>,
}

impl TokenProxy {
    pub fn new(config: TokenProxyConfig, transport: Arc<dyn HttpTransport>) -> NgsiResult<Self> {
        Ok(Self::from_state(TokenProxyState::new(&config, transport)?))
    }

    pub fn from_state(state: TokenProxyState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<TokenProxyState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    pub async fn run(&self, listen: &ListenConfig) -> NgsiResult<()> {
        listen.validate(SERVER_STAGE)?;

        tracing::info!("Start token proxy: {}", listen.proxy_url());
        tracing::info!("Endpoints:");
        tracing::info!("  POST /token   - Request token from {}", self.state.token_url);
        tracing::info!("  POST /revoke  - Revoke token at {}", self.state.revoke_url);
        tracing::info!("  GET  /health  - Health check");

        crate::serve(self.router(), listen)
            .await
            .map_err(|e| NgsiError::with_source(SERVER_STAGE, if listen.https { 4 } else { 5 }, e))
    }
}

/// Create the token proxy router
pub fn create_router(state: Arc<TokenProxyState>) -> Router {
    Router::new()
        .route("/token", any(token))
        .route("/revoke", any(revoke))
        .route("/health", any(health))
        .fallback(|uri: Uri| async move { common::not_found("tokenProxyRootHandler", &uri) })
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct TokenProxyHealth<'a> {
    #[serde(rename = "ngsi-go")]
    ngsi_go: &'a str,
    version: &'a str,
    health: &'a str,
    idm: String,
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
    verbose: bool,
    uptime: String,
    timesent: i64,
    success: i64,
    revoke: i64,
    failure: i64,
}

async fn health(State(state): State<Arc<TokenProxyState>>, method: Method) -> Response {
    if method != Method::GET {
        return common::method_not_allowed("tokenProxyHealthHandler");
    }

    let snapshot = state.stats.snapshot();
    let info = TokenProxyHealth {
        ngsi_go: "tokenproxy",
        version: ngsi_core::VERSION,
        health: "OK",
        idm: state.token_url.to_string(),
        client_id: &state.client_id,
        client_secret: &state.client_secret,
        verbose: state.verbose,
        uptime: snapshot.uptime,
        timesent: snapshot.time_sent,
        success: snapshot.success,
        revoke: snapshot.revoke,
        failure: snapshot.failure,
    };

    common::health_response("tokenproxy", &info)
}

/// Fields accepted on `/token`
#[derive(Debug, Default, Deserialize)]
struct TokenRequest {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    scope: Option<String>,
}

/// Fields accepted on `/revoke`
#[derive(Debug, Default, Deserialize)]
struct RevokeRequest {
    token: Option<String>,
    token_type_hint: Option<String>,
}

async fn token(
    State(state): State<Arc<TokenProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return common::method_not_allowed(HANDLER_STAGE);
    }
    tracing::info!("{}", stage_message(HANDLER_STAGE, 2, uri.path()));

    match token_body(&headers, uri.query(), &body, state.verbose) {
        Ok(form) => forward(&state, state.token_url.clone(), form, Outcome::Success).await,
        Err(e) => error_response(&state.stats, &e),
    }
}

async fn revoke(
    State(state): State<Arc<TokenProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return common::method_not_allowed(HANDLER_STAGE);
    }
    tracing::info!("{}", stage_message(HANDLER_STAGE, 2, uri.path()));

    match revoke_body(&headers, uri.query(), &body) {
        Ok(form) => forward(&state, state.revoke_url.clone(), form, Outcome::Revoke).await,
        Err(e) => error_response(&state.stats, &e),
    }
}

/// POST the prepared form to the IdM and relay the answer as JSON
async fn forward(state: &TokenProxyState, url: Url, form: String, outcome: Outcome) -> Response {
    let request = OutboundRequest::post(url)
        .header("Authorization", &state.authorization)
        .and_then(|r| r.header("Content-Type", FORM_URLENCODED))
        .map(|r| r.body(form));

    let result = match request {
        Ok(request) => state.transport.request(request).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(upstream) => {
            state.stats.record(outcome);
            if state.verbose {
                tracing::info!(
                    "{}",
                    stage_message(HANDLER_STAGE, 3, &format!("{} {}", upstream.status.as_u16(), upstream.body_text()))
                );
            }
            json_relay(upstream)
        }
        Err(e) => error_response(&state.stats, &NgsiError::wrap(HANDLER_STAGE, 4, e)),
    }
}

/// Upstream status and body, always labelled as JSON
fn json_relay(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    response
}

/// Decode a JSON or urlencoded request into `T`, rejecting form fields
/// outside `allowed`.
fn decode<T>(
    stage: &'static str,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &[u8],
    allowed: &[&str],
    from_fields: impl FnOnce(BTreeMap<String, String>) -> T,
) -> NgsiResult<T>
where
    T: DeserializeOwned,
{
    let media =
        form::media_type(headers).ok_or_else(|| NgsiError::new(stage, 1, "missing Content-Type"))?;

    match media.as_str() {
        APPLICATION_JSON => serde_json::from_slice(body).map_err(|e| NgsiError::with_source(stage, 3, e)),
        FORM_URLENCODED => {
            let fields = form::parse_form(query, body).map_err(|e| NgsiError::with_source(stage, 4, e))?;
            if let Some(unknown) = fields.keys().find(|k| !allowed.contains(&k.as_str())) {
                return Err(NgsiError::new(stage, 5, format!("unknown parameter: {}", unknown)));
            }
            Ok(from_fields(fields))
        }
        _ => Err(NgsiError::new(stage, 2, "Content-Type error")),
    }
}

/// Build the grant form for `/token`
fn token_body(headers: &HeaderMap, query: Option<&str>, body: &[u8], verbose: bool) -> NgsiResult<String> {
    let mut req: TokenRequest = decode(
        REQUEST_STAGE,
        headers,
        query,
        body,
        &["username", "password", "token", "scope"],
        |mut f| TokenRequest {
            username: f.remove("username"),
            password: f.remove("password"),
            token: f.remove("token"),
            scope: f.remove("scope"),
        },
    )?;

    let mut form = form_urlencoded::Serializer::new(String::new());
    let mut log = form_urlencoded::Serializer::new(String::new());

    match (req.username.take(), req.password.take(), req.token.take()) {
        (Some(username), Some(password), None) => {
            form.append_pair("grant_type", "password")
                .append_pair("username", &username)
                .append_pair("password", &password);
            log.append_pair("grant_type", "password")
                .append_pair("username", &username);
            if verbose {
                log.append_pair("password", &password);
            } else {
                log.append_pair("password", "*****");
            }
        }
        (None, None, Some(token)) => {
            form.append_pair("grant_type", "refresh_token")
                .append_pair("refresh_token", &token);
            log.append_pair("grant_type", "refresh_token")
                .append_pair("refresh_token", &token);
        }
        _ => return Err(NgsiError::new(REQUEST_STAGE, 6, "parameter error")),
    }

    if let Some(scope) = &req.scope {
        form.append_pair("scope", scope);
        log.append_pair("scope", scope);
    }

    tracing::info!("{}", stage_message(REQUEST_STAGE, 7, &log.finish()));
    Ok(form.finish())
}

/// Build the revocation form for `/revoke`
fn revoke_body(headers: &HeaderMap, query: Option<&str>, body: &[u8]) -> NgsiResult<String> {
    let req: RevokeRequest = decode(
        REVOKE_STAGE,
        headers,
        query,
        body,
        &["token", "token_type_hint"],
        |mut f| RevokeRequest {
            token: f.remove("token"),
            token_type_hint: f.remove("token_type_hint"),
        },
    )?;

    let token = req
        .token
        .ok_or_else(|| NgsiError::new(REVOKE_STAGE, 6, "parameter error"))?;
    let hint = req.token_type_hint.as_deref().unwrap_or("refresh_token");

    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("token", &token)
        .append_pair("token_type_hint", hint)
        .finish();

    tracing::info!("{}", stage_message(REVOKE_STAGE, 7, &form));
    Ok(form)
}
