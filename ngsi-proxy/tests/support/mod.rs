//! Shared helpers for the proxy integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;

use ngsi_core::{HttpTransport, NgsiError, NgsiResult, OutboundRequest, UpstreamResponse};

/// Upstream stand-in that records every request and answers with a fixed
/// response, or fails like an unreachable host.
pub struct RecordingTransport {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    fail: bool,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl RecordingTransport {
    pub fn ok(body: &'static str) -> Arc<Self> {
        Self::with_status(StatusCode::OK, body)
    }

    pub fn with_status(status: StatusCode, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
            fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_headers(status: StatusCode, headers: HeaderMap, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status,
            headers,
            body: Bytes::from_static(body.as_bytes()),
            fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    pub fn last(&self) -> OutboundRequest {
        self.requests
            .lock()
            .last()
            .cloned()
            .expect("no upstream request recorded")
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn request(&self, request: OutboundRequest) -> NgsiResult<UpstreamResponse> {
        self.requests.lock().push(request);
        if self.fail {
            return Err(NgsiError::new("httpRequest", 2, "connection refused"));
        }
        Ok(UpstreamResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        })
    }
}

pub fn form_post(uri: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

pub fn json_post(uri: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}
