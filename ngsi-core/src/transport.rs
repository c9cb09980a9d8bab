//! Upstream HTTP transport
//!
//! Proxies never talk to `reqwest` directly; they build an
//! [`OutboundRequest`] and hand it to an [`HttpTransport`]. Tests swap in a
//! recording implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

use crate::error::{NgsiError, NgsiResult};

/// One request to a broker or identity manager
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    /// Set a header, replacing any previous value
    pub fn header(mut self, name: &str, value: &str) -> NgsiResult<Self> {
        self.set_header(name, value)?;
        Ok(self)
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> NgsiResult<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| NgsiError::with_source("setHeader", 1, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| NgsiError::with_source("setHeader", 2, e))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// What came back from upstream. Non-2xx statuses are not errors.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// `"401 Unauthorized"`
    pub fn status_line(&self) -> String {
        status_line(self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// Transport backend interface
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue one request. Errors mean nothing usable came back.
    async fn request(&self, request: OutboundRequest) -> NgsiResult<UpstreamResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout_ms: u64) -> NgsiResult<Self> {
        let mut builder = reqwest::Client::builder();
        if timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let client = builder
            .build()
            .map_err(|e| NgsiError::with_source("httpRequest", 1, e))?;

        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(&self, request: OutboundRequest) -> NgsiResult<UpstreamResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| NgsiError::with_source("httpRequest", 2, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| NgsiError::with_source("httpRequest", 3, e))?;

        Ok(UpstreamResponse { status, headers, body })
    }
}
