//! NGSI Proxies - small HTTP front-ends for FIWARE brokers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      ┌─────────────────────┐      ┌─────────────┐
//! │   Client    │──────│   Proxy             │──────│  Orion /    │
//! │  (browser,  │ POST │                     │ GET/ │  Keyrock    │
//! │   script)   │ form │  1. Check method    │ POST │             │
//! └─────────────┘      │  2. Transform form  │      └─────────────┘
//!                      │  3. Forward         │
//!                      │  4. Count + relay   │
//!                      └─────────────────────┘
//! ```
//!
//! - [`query`]: query and geo proxies, form POST to `GET /v2/entities`
//! - [`token`]: token proxy holding IdM client credentials
//! - [`receiver`]: notification receiver printing what it gets
//! - [`health`]: client side of every proxy's `/health`
//!
//! Every proxy answers unknown paths with `400 {"error": "<path> not found"}`
//! and action endpoints only accept `POST`.

pub mod common;
pub mod form;
pub mod health;
pub mod query;
pub mod receiver;
pub mod token;

use std::net::SocketAddr;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;

use ngsi_core::{NgsiError, NgsiResult};

pub use query::{Flavor, QueryProxy, QueryProxyConfig, QueryProxyState};
pub use receiver::{Receiver, ReceiverConfig, ReceiverState};
pub use token::{TokenProxy, TokenProxyConfig, TokenProxyState};

/// Where a proxy listens
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub key: Option<String>,
    pub cert: Option<String>,
}

impl ListenConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            https: false,
            key: None,
            cert: None,
        }
    }

    /// Serve over TLS with the given PEM files
    pub fn tls(mut self, key: Option<String>, cert: Option<String>) -> Self {
        self.https = true;
        self.key = key;
        self.cert = cert;
        self
    }

    /// HTTPS needs both a key and a certificate
    pub fn validate(&self, stage: &'static str) -> NgsiResult<()> {
        if self.https {
            if self.key.is_none() {
                return Err(NgsiError::new(stage, 1, "no key file provided"));
            }
            if self.cert.is_none() {
                return Err(NgsiError::new(stage, 2, "no cert file provided"));
            }
        }
        Ok(())
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `http(s)://host:port`, as logged at start-up
    pub fn proxy_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}", scheme, self.addr())
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self::new("0.0.0.0", 1030)
    }
}

/// Serve `app` until the listener fails
pub async fn serve(app: Router, listen: &ListenConfig) -> std::io::Result<()> {
    let addr = resolve(listen).await?;

    match (&listen.key, &listen.cert) {
        (Some(key), Some(cert)) if listen.https => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await
        }
    }
}

async fn resolve(listen: &ListenConfig) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(listen.addr())
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", listen.addr()),
            )
        })
}
