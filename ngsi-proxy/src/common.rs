//! Handler pieces shared by every proxy

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use ngsi_core::error::stage_message;
use ngsi_core::{NgsiError, Outcome, ProxyStats, UpstreamResponse};

/// Inbound headers that are never copied to the upstream request
const SKIPPED_REQUEST_HEADERS: [&str; 4] = ["content-length", "user-agent", "content-type", "host"];

/// Upstream headers that are never copied back to the caller
const SKIPPED_RESPONSE_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Catch-all for unknown paths: always 400 with a not-found body
pub(crate) fn not_found(stage: &'static str, uri: &Uri) -> Response {
    let path = uri.path();
    tracing::error!("{}", stage_message(stage, 1, path));

    let message = serde_json::Value::String(format!("{} not found", path));
    let body = format!("{{\"error\": {}}}", message);
    json_response(StatusCode::BAD_REQUEST, body)
}

pub(crate) fn method_not_allowed(stage: &'static str) -> Response {
    tracing::error!("{}", stage_message(stage, 1, "Method not allowed"));
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

/// Count a failure and render `{"error":"<stage><NNN> <message>"}` with 400
pub(crate) fn error_response(stats: &ProxyStats, err: &NgsiError) -> Response {
    stats.record(Outcome::Failure);

    let message = err.diagnostic();
    tracing::error!("{}", message);

    let body = serde_json::json!({ "error": message }).to_string();
    json_response(StatusCode::BAD_REQUEST, body)
}

/// Serialize a health payload, falling back to `{"ngsi-go":"<name>","health":"NG"}`
pub(crate) fn health_response<T: Serialize>(name: &str, info: &T) -> Response {
    let body = serde_json::to_string(info).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to serialize health info");
        format!("{{\"ngsi-go\":\"{}\",\"health\":\"NG\"}}", name)
    });
    json_response(StatusCode::OK, body)
}

pub(crate) fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

/// Tenant headers seen on a forwarded request, kept for logging
#[derive(Debug, Default)]
pub(crate) struct Tenant {
    pub service: Option<String>,
    pub service_path: Option<String>,
}

/// Copy inbound headers for the upstream call, dropping the ones the
/// outbound client sets itself.
pub(crate) fn forward_headers(inbound: &HeaderMap) -> (HeaderMap, Tenant) {
    let mut headers = HeaderMap::new();
    let mut tenant = Tenant::default();

    for (name, value) in inbound {
        let key = name.as_str();
        if SKIPPED_REQUEST_HEADERS.contains(&key) {
            continue;
        }
        match key {
            "fiware-service" | "ngsild-tenant" => {
                tenant.service = value.to_str().ok().map(str::to_string);
            }
            "fiware-servicepath" => {
                tenant.service_path = value.to_str().ok().map(str::to_string);
            }
            _ => {}
        }
        if !headers.contains_key(name) {
            headers.insert(name.clone(), value.clone());
        }
    }

    (headers, tenant)
}

/// Relay an upstream response: status, headers (minus framing) and body
pub(crate) fn relay_response(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;

    let headers = response.headers_mut();
    for (name, value) in &upstream.headers {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) || headers.contains_key(name) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_forward_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert("fiware-service", HeaderValue::from_static("openiot"));
        inbound.insert("fiware-servicepath", HeaderValue::from_static("/iot"));
        inbound.insert("content-type", HeaderValue::from_static("application/x-www-form-urlencoded"));
        inbound.insert("content-length", HeaderValue::from_static("29"));
        inbound.insert("user-agent", HeaderValue::from_static("curl/7.68.0"));
        inbound.insert("host", HeaderValue::from_static("localhost:1030"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));

        let (headers, tenant) = forward_headers(&inbound);

        assert_eq!(headers.len(), 3);
        assert_eq!(headers["fiware-service"], "openiot");
        assert_eq!(headers["fiware-servicepath"], "/iot");
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(tenant.service.as_deref(), Some("openiot"));
        assert_eq!(tenant.service_path.as_deref(), Some("/iot"));
    }

    #[test]
    fn test_relay_response_drops_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("2"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("fiware-total-count", HeaderValue::from_static("7"));

        let response = relay_response(UpstreamResponse {
            status: StatusCode::NOT_FOUND,
            headers,
            body: Bytes::from_static(b"{}"),
        });

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["fiware-total-count"], "7");
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_error_response_counts_failure() {
        let stats = ProxyStats::new();
        let err = NgsiError::new("tokeProxyRequestToken", 1, "missing Content-Type");

        let response = error_response(&stats, &err);

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let snap = stats.snapshot();
        assert_eq!((snap.time_sent, snap.failure), (1, 1));
    }
}
