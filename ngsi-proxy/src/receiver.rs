//! Notification receiver
//!
//! A tiny endpoint for subscriptions: every notification POSTed to it is
//! written to an output stream, optionally preceded by its headers and
//! optionally pretty-printed.

use std::io::Write;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use parking_lot::Mutex;
use tower_http::trace::TraceLayer;

use ngsi_core::{json, NgsiError, NgsiResult};

use crate::ListenConfig;

const STAGE: &str = "receiver";

/// Default path notifications are accepted on
pub const DEFAULT_PATH: &str = "/";

/// Destination for notification output
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub path: String,
    /// Indent JSON bodies
    pub pretty: bool,
    /// Print request headers before the body
    pub header: bool,
    pub verbose: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            pretty: false,
            header: false,
            verbose: false,
        }
    }
}

/// Receiver state: flags plus the two output streams
pub struct ReceiverState {
    pretty: bool,
    header: bool,
    out: SharedWriter,
    err: SharedWriter,
}

impl ReceiverState {
    pub fn new(config: &ReceiverConfig, out: SharedWriter, err: SharedWriter) -> Self {
        Self {
            pretty: config.pretty,
            header: config.header,
            out,
            err,
        }
    }

    /// Write to the process stdout and stderr
    pub fn stdio(config: &ReceiverConfig) -> Self {
        Self::new(
            config,
            Arc::new(Mutex::new(Box::new(std::io::stdout()))),
            Arc::new(Mutex::new(Box::new(std::io::stderr()))),
        )
    }
}

/// Notification receiver server
pub struct Receiver {
    state: Arc<ReceiverState>,
    path: String,
    verbose: bool,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, state: ReceiverState) -> Self {
        let path = if config.path.starts_with('/') {
            config.path
        } else {
            format!("/{}", config.path)
        };

        Self {
            state: Arc::new(state),
            path,
            verbose: config.verbose,
        }
    }

    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.path)
    }

    pub async fn run(&self, listen: &ListenConfig) -> NgsiResult<()> {
        listen.validate(STAGE)?;

        let url = format!("{}{}", listen.proxy_url(), self.path);
        if self.verbose {
            let mut err = self.state.err.lock();
            writeln!(err, "{}", url).map_err(|e| NgsiError::with_source(STAGE, 5, e))?;
        }
        tracing::info!("{}", url);

        crate::serve(self.router(), listen)
            .await
            .map_err(|e| NgsiError::with_source(STAGE, if listen.https { 3 } else { 4 }, e))
    }
}

/// A path ending in `/` also takes everything below it
pub fn create_router(state: Arc<ReceiverState>, path: &str) -> Router {
    let mut router = Router::new().route(path, any(receive));
    if path.ends_with('/') {
        router = router.route(&format!("{}*rest", path), any(receive));
    }
    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn receive(
    State(state): State<Arc<ReceiverState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        let mut err = state.err.lock();
        if let Err(e) = writeln!(err, "Method not allowed.").and_then(|_| err.flush()) {
            tracing::warn!(error = %e, "Failed to write to error stream");
        }
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let sorted = sorted_headers(&headers);
    let listing: Vec<String> = sorted.iter().map(|(k, v)| format!("{}:[{}]", k, v)).collect();
    tracing::info!("[{}]", listing.join(" "));
    tracing::info!("{}", String::from_utf8_lossy(&body));

    if let Err(e) = write_notification(&state, &sorted, &body) {
        tracing::error!(error = %e, "Failed to write notification");
    }

    StatusCode::NO_CONTENT.into_response()
}

fn write_notification(
    state: &ReceiverState,
    headers: &[(String, String)],
    body: &[u8],
) -> std::io::Result<()> {
    let text = if state.pretty && json::is_json(body) {
        json::indent(body).unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
    } else {
        String::from_utf8_lossy(body).into_owned()
    };

    let mut out = state.out.lock();
    if state.header {
        for (name, value) in headers {
            writeln!(out, "{}: {}", name, value)?;
        }
        writeln!(out)?;
    }
    writeln!(out, "{}", text)?;
    out.flush()
}

/// Header names in canonical `Fiware-Servicepath` form, sorted, first value
/// of each. `Host` is part of the request line, not a header.
fn sorted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut sorted: Vec<(String, String)> = headers
        .keys()
        .filter(|name| name.as_str() != "host")
        .filter_map(|name| {
            let value = headers.get(name)?;
            Some((
                canonical_name(name.as_str()),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ))
        })
        .collect();
    sorted.sort();
    sorted
}

fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
