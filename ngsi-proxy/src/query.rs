//! Query and geo proxies
//!
//! Both accept a `POST` with a urlencoded form on their action path and turn
//! it into `GET <broker>/v2/entities?<form>`. Long or awkward queries (geo
//! coordinates, `q` expressions) can then travel in a request body. The two
//! flavors only differ in the names they report.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Response,
    routing::any,
    Router,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use url::Url;

use ngsi_core::error::stage_message;
use ngsi_core::{
    AuthHeaderProvider, BrokerConfig, HttpTransport, NgsiError, NgsiResult, OutboundRequest,
    Outcome, ProxyStats, TokenManager,
};

use crate::common::{self, error_response, forward_headers, relay_response};
use crate::form::{self, FORM_URLENCODED};
use crate::ListenConfig;

/// Default path the proxy listens on for queries
pub const DEFAULT_ACTION_PATH: &str = "/v2/ex/entities";

/// Log consumers match on this stage name, shared with the token proxy.
const SET_QUERY_STAGE: &str = "tokeProxyRequestToken";

/// Which proxy is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Query,
    Geo,
}

impl Flavor {
    /// Name reported as `ngsi-go` on `/health`
    pub fn name(&self) -> &'static str {
        match self {
            Flavor::Query => "queryproxy",
            Flavor::Geo => "geoproxy",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Flavor::Query => "query proxy",
            Flavor::Geo => "geo proxy",
        }
    }

    fn server_stage(&self) -> &'static str {
        match self {
            Flavor::Query => "queryProxy",
            Flavor::Geo => "geoProxy",
        }
    }

    fn handler_stage(&self) -> &'static str {
        match self {
            Flavor::Query => "queryProxyHandler",
            Flavor::Geo => "geoProxyHandler",
        }
    }

    fn root_stage(&self) -> &'static str {
        match self {
            Flavor::Query => "queryProxyRootHandler",
            Flavor::Geo => "geoProxyRootHandler",
        }
    }

    fn health_stage(&self) -> &'static str {
        match self {
            Flavor::Query => "queryProxyHealthHandler",
            Flavor::Geo => "geoProxyHealthHandler",
        }
    }

    /// Stage used by the `health` companion command
    pub fn health_command_stage(&self) -> &'static str {
        match self {
            Flavor::Query => "queryProxyHealth",
            Flavor::Geo => "geoProxyHealth",
        }
    }
}

/// Query proxy configuration
#[derive(Debug, Clone)]
pub struct QueryProxyConfig {
    pub flavor: Flavor,
    pub broker: BrokerConfig,
    /// Path that accepts the form POSTs
    pub action_path: String,
    /// Log upstream responses
    pub verbose: bool,
}

impl QueryProxyConfig {
    pub fn new(flavor: Flavor, broker: BrokerConfig) -> Self {
        Self {
            flavor,
            broker,
            action_path: DEFAULT_ACTION_PATH.to_string(),
            verbose: false,
        }
    }

    pub fn action_path(mut self, path: &str) -> Self {
        self.action_path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Shared proxy state
pub struct QueryProxyState {
    flavor: Flavor,
    /// `<broker>/v2/entities`; cloned per request, never mutated
    upstream: Url,
    transport: Arc<dyn HttpTransport>,
    verbose: bool,
    /// Held across the whole read-or-refresh of the broker token
    auth: Option<Mutex<Box<dyn AuthHeaderProvider>>>,
    stats: ProxyStats,
}

impl QueryProxyState {
    pub fn new(config: &QueryProxyConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let auth: Option<Mutex<Box<dyn AuthHeaderProvider>>> = match &config.broker.idm {
            Some(idm) if config.broker.requires_auth() => Some(Mutex::new(Box::new(
                TokenManager::new(idm.clone(), Arc::clone(&transport)),
            ))),
            _ => None,
        };

        Self::with_auth(config, transport, auth)
    }

    /// Use a caller-supplied auth header provider
    pub fn with_auth(
        config: &QueryProxyConfig,
        transport: Arc<dyn HttpTransport>,
        auth: Option<Mutex<Box<dyn AuthHeaderProvider>>>,
    ) -> Self {
        Self {
            flavor: config.flavor,
            upstream: entities_url(&config.broker.url),
            transport,
            verbose: config.verbose,
            auth,
            stats: ProxyStats::new(),
        }
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }
}

/// Query or geo proxy server
pub struct QueryProxy {
    state: Arc<QueryProxyState>,
    action_path: String,
}

impl QueryProxy {
    pub fn new(config: QueryProxyConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let state = QueryProxyState::new(&config, transport);
        Self::from_state(state, &config.action_path)
    }

    pub fn from_state(state: QueryProxyState, action_path: &str) -> Self {
        Self {
            state: Arc::new(state),
            action_path: action_path.to_string(),
        }
    }

    pub fn state(&self) -> &Arc<QueryProxyState> {
        &self.state
    }

    /// Build the router
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.action_path)
    }

    /// Run the proxy until the listener fails
    pub async fn run(&self, listen: &ListenConfig) -> NgsiResult<()> {
        let stage = self.state.flavor.server_stage();
        listen.validate(stage)?;

        tracing::info!("Start {}: {}", self.state.flavor.title(), listen.proxy_url());
        tracing::info!("Endpoints:");
        tracing::info!("  POST {:<16} - Forward as GET {}", self.action_path, self.state.upstream);
        tracing::info!("  GET  {:<16} - Health check", "/health");

        crate::serve(self.router(), listen)
            .await
            .map_err(|e| NgsiError::with_source(stage, if listen.https { 3 } else { 4 }, e))
    }
}

/// Create the proxy router
pub fn create_router(state: Arc<QueryProxyState>, action_path: &str) -> Router {
    let root_stage = state.flavor.root_stage();

    Router::new()
        .route("/health", any(health))
        .route(action_path, any(forward_query))
        .fallback(move |uri: Uri| async move { common::not_found(root_stage, &uri) })
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct QueryProxyHealth<'a> {
    #[serde(rename = "ngsi-go")]
    ngsi_go: &'a str,
    version: &'a str,
    health: &'a str,
    orion: String,
    verbose: bool,
    uptime: String,
    timesent: i64,
    success: i64,
    failure: i64,
}

async fn health(State(state): State<Arc<QueryProxyState>>, method: Method) -> Response {
    if method != Method::GET {
        return common::method_not_allowed(state.flavor.health_stage());
    }

    let snapshot = state.stats.snapshot();
    let info = QueryProxyHealth {
        ngsi_go: state.flavor.name(),
        version: ngsi_core::VERSION,
        health: "OK",
        orion: state.upstream.to_string(),
        verbose: state.verbose,
        uptime: snapshot.uptime,
        timesent: snapshot.time_sent,
        success: snapshot.success,
        failure: snapshot.failure,
    };

    common::health_response(state.flavor.name(), &info)
}

/// Turn a form POST into a broker GET
async fn forward_query(
    State(state): State<Arc<QueryProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let stage = state.flavor.handler_stage();

    if method != Method::POST {
        return common::method_not_allowed(stage);
    }

    let request_id = uuid::Uuid::new_v4();
    tracing::info!(%request_id, "{}", stage_message(stage, 2, uri.path()));

    match build_request(&state, &uri, &headers, &body).await {
        Ok(request) => match state.transport.request(request).await {
            Ok(upstream) => {
                state.stats.record(Outcome::Success);
                if state.verbose {
                    tracing::info!(
                        %request_id,
                        "{}",
                        stage_message(stage, 5, &format!("{} {}", upstream.status.as_u16(), upstream.body_text()))
                    );
                }
                relay_response(upstream)
            }
            Err(e) => error_response(&state.stats, &NgsiError::wrap(stage, 6, e)),
        },
        Err(e) => error_response(&state.stats, &e),
    }
}

async fn build_request(
    state: &QueryProxyState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> NgsiResult<OutboundRequest> {
    let stage = state.flavor.handler_stage();

    let mut url = state.upstream.clone();
    let (forwarded, tenant) = forward_headers(headers);
    tracing::debug!(service = ?tenant.service, service_path = ?tenant.service_path, "Tenant");

    let mut request = OutboundRequest::get(url.clone());
    request.headers = forwarded;

    if let Some(auth) = &state.auth {
        let mut provider = auth.lock().await;
        let (name, value) = provider
            .auth_header()
            .await
            .map_err(|e| NgsiError::wrap(stage, 4, e))?;
        request
            .set_header(&name, &value)
            .map_err(|e| NgsiError::wrap(stage, 4, e))?;
    }

    set_query_params(headers, uri.query(), body, &mut url)?;
    request.url = url;

    Ok(request)
}

/// Copy the form fields into the query string of `url`
pub(crate) fn set_query_params(
    headers: &HeaderMap,
    query: Option<&str>,
    body: &[u8],
    url: &mut Url,
) -> NgsiResult<()> {
    let media = form::media_type(headers)
        .ok_or_else(|| NgsiError::new(SET_QUERY_STAGE, 1, "missing Content-Type"))?;
    if media != FORM_URLENCODED {
        return Err(NgsiError::new(SET_QUERY_STAGE, 3, "Content-Type error"));
    }

    let fields = form::parse_form(query, body).map_err(|e| NgsiError::with_source(SET_QUERY_STAGE, 2, e))?;

    let mut params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    params.extend(fields);

    if params.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&params);
    }
    Ok(())
}

/// `<broker>/v2/entities`, keeping any base path the broker URL has
fn entities_url(broker: &Url) -> Url {
    let mut url = broker.clone();
    let path = format!("{}/v2/entities", broker.path().trim_end_matches('/'));
    url.set_path(&path);
    url
}
