//! Auth headers for brokers behind an identity manager
//!
//! [`TokenManager`] owns the cached access token. It takes `&mut self`, so
//! whoever shares it has to put it behind a lock, and that lock is held for
//! the whole read-or-refresh. Two requests can then never refresh the same
//! token twice or see a half-written one.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use url::form_urlencoded;
use url::Url;

use crate::config::IdmConfig;
use crate::error::{NgsiError, NgsiResult};
use crate::transport::{HttpTransport, OutboundRequest};

/// Cached tokens are renewed this many seconds before they expire
pub const TOKEN_MARGIN_SECS: i64 = 180;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const APPLICATION_JSON: &str = "application/json";

/// Supported identity managers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdmType {
    /// HTTP basic auth with the broker user
    Basic,
    /// Static header
    Apikey,
    /// Keyrock OAuth2 password grant
    Keyrock,
    /// Generic OAuth2 password-credentials grant
    PasswordCredentials,
    /// The token proxy in this workspace
    TokenProxy,
    /// Keyrock token provider
    KeyrockTokenProvider,
}

impl IdmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdmType::Basic => "basic",
            IdmType::Apikey => "apikey",
            IdmType::Keyrock => "keyrock",
            IdmType::PasswordCredentials => "password",
            IdmType::TokenProxy => "tokenproxy",
            IdmType::KeyrockTokenProvider => "keyrocktokenprovider",
        }
    }

    fn supports_refresh(&self) -> bool {
        matches!(self, IdmType::Keyrock | IdmType::PasswordCredentials)
    }
}

impl FromStr for IdmType {
    type Err = NgsiError;

    fn from_str(s: &str) -> NgsiResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(IdmType::Basic),
            "apikey" => Ok(IdmType::Apikey),
            "keyrock" => Ok(IdmType::Keyrock),
            "password" => Ok(IdmType::PasswordCredentials),
            "tokenproxy" => Ok(IdmType::TokenProxy),
            "keyrocktokenprovider" => Ok(IdmType::KeyrockTokenProvider),
            _ => Err(NgsiError::new(
                "getAuthHeader",
                1,
                format!("unknown idm type: {}", s),
            )),
        }
    }
}

/// Source of the `(name, value)` auth header attached to broker requests
#[async_trait]
pub trait AuthHeaderProvider: Send + Sync {
    /// Current header, fetching or refreshing the token if needed
    async fn auth_header(&mut self) -> NgsiResult<(String, String)>;
}

/// OAuth2 token response
#[derive(Debug, Clone, Deserialize)]
struct OauthToken {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

/// Token cache and fetcher for one broker
pub struct TokenManager {
    idm: IdmConfig,
    transport: Arc<dyn HttpTransport>,
    cached: Option<CachedToken>,
    margin: Duration,
}

impl TokenManager {
    pub fn new(idm: IdmConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            idm,
            transport,
            cached: None,
            margin: Duration::seconds(TOKEN_MARGIN_SECS),
        }
    }

    pub fn with_margin(mut self, secs: i64) -> Self {
        self.margin = Duration::seconds(secs);
        self
    }

    /// Access token currently held, if any
    pub fn cached_token(&self) -> Option<&str> {
        self.cached.as_ref().map(|c| c.access_token.as_str())
    }

    async fn token(&mut self, idm_type: IdmType) -> NgsiResult<String> {
        let now = Utc::now();
        if let Some(cached) = &self.cached {
            if cached.expires_at > now + self.margin {
                tracing::debug!("Cached token is used");
                return Ok(cached.access_token.clone());
            }
        }

        let refresh = self.cached.take().and_then(|c| c.refresh_token);
        let fresh = match refresh {
            Some(refresh_token) if idm_type.supports_refresh() => {
                match self.refresh_token(idm_type, &refresh_token).await {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(error = %e.display_diagnostic(), "Token refresh failed, requesting a new token");
                        self.request_token(idm_type).await?
                    }
                }
            }
            _ => self.request_token(idm_type).await?,
        };

        let access_token = fresh.access_token.clone();
        self.cached = Some(fresh);
        Ok(access_token)
    }

    async fn request_token(&self, idm_type: IdmType) -> NgsiResult<CachedToken> {
        const STAGE: &str = "requestToken";

        let (username, password) = self.user_credentials(STAGE)?;
        let url = self.idm_url(STAGE)?;

        let request = match idm_type {
            IdmType::Keyrock => OutboundRequest::post(url)
                .header("Content-Type", FORM_URLENCODED)?
                .header("Authorization", &self.client_basic_auth())?
                .body(form(&[
                    ("grant_type", "password"),
                    ("username", username),
                    ("password", password),
                ])),
            IdmType::PasswordCredentials => {
                let (client_id, client_secret) = self.client_credentials();
                OutboundRequest::post(url)
                    .header("Content-Type", FORM_URLENCODED)?
                    .body(form(&[
                        ("grant_type", "password"),
                        ("username", username),
                        ("password", password),
                        ("client_id", client_id),
                        ("client_secret", client_secret),
                    ]))
            }
            IdmType::KeyrockTokenProvider => OutboundRequest::post(url)
                .header("Content-Type", FORM_URLENCODED)?
                .body(form(&[("username", username), ("password", password)])),
            IdmType::TokenProxy => {
                let payload = serde_json::json!({"username": username, "password": password});
                OutboundRequest::post(url)
                    .header("Content-Type", APPLICATION_JSON)?
                    .body(payload.to_string())
            }
            IdmType::Basic | IdmType::Apikey => {
                return Err(NgsiError::new(
                    STAGE,
                    2,
                    format!("{} does not issue tokens", idm_type.as_str()),
                ))
            }
        };

        tracing::info!(idm_type = idm_type.as_str(), "Requesting access token");
        let body = self.send(STAGE, request).await?;

        if idm_type == IdmType::KeyrockTokenProvider {
            return Ok(CachedToken {
                access_token: String::from_utf8_lossy(&body).trim().to_string(),
                refresh_token: None,
                expires_at: Utc::now() + Duration::seconds(3600),
            });
        }

        parse_oauth_token(STAGE, &body)
    }

    async fn refresh_token(&self, idm_type: IdmType, refresh_token: &str) -> NgsiResult<CachedToken> {
        const STAGE: &str = "refreshToken";

        let url = self.idm_url(STAGE)?;
        let request = match idm_type {
            IdmType::Keyrock => OutboundRequest::post(url)
                .header("Content-Type", FORM_URLENCODED)?
                .header("Authorization", &self.client_basic_auth())?
                .body(form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ])),
            _ => {
                let (client_id, client_secret) = self.client_credentials();
                OutboundRequest::post(url)
                    .header("Content-Type", FORM_URLENCODED)?
                    .body(form(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                        ("client_id", client_id),
                        ("client_secret", client_secret),
                    ]))
            }
        };

        tracing::info!(idm_type = idm_type.as_str(), "Refreshing access token");
        let body = self.send(STAGE, request).await?;
        parse_oauth_token(STAGE, &body)
    }

    async fn send(&self, stage: &'static str, request: OutboundRequest) -> NgsiResult<bytes::Bytes> {
        let response = self
            .transport
            .request(request)
            .await
            .map_err(|e| NgsiError::wrap(stage, 4, e))?;

        if response.status != http::StatusCode::OK && response.status != http::StatusCode::CREATED {
            return Err(NgsiError::new(
                stage,
                5,
                format!("error {} {}", response.status_line(), response.body_text()),
            ));
        }

        Ok(response.body)
    }

    fn idm_url(&self, stage: &'static str) -> NgsiResult<Url> {
        let host = self
            .idm
            .idm_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| NgsiError::new(stage, 6, "idmHost not found"))?;
        Url::parse(host).map_err(|e| NgsiError::with_source(stage, 7, e))
    }

    fn user_credentials(&self, stage: &'static str) -> NgsiResult<(&str, &str)> {
        match (self.idm.username.as_deref(), self.idm.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Ok((user, pass)),
            _ => Err(NgsiError::new(stage, 1, "username and password are needed")),
        }
    }

    fn client_credentials(&self) -> (&str, &str) {
        (
            self.idm.client_id.as_deref().unwrap_or_default(),
            self.idm.client_secret.as_deref().unwrap_or_default(),
        )
    }

    fn client_basic_auth(&self) -> String {
        let (client_id, client_secret) = self.client_credentials();
        format!("Basic {}", STANDARD.encode(format!("{}:{}", client_id, client_secret)))
    }

    fn basic_header(&self) -> NgsiResult<(String, String)> {
        let (username, password) = self.user_credentials("getAuthHeader")?;
        let token = URL_SAFE.encode(format!("{}:{}", username, password));
        Ok(("Authorization".to_string(), format!("Basic {}", token)))
    }

    fn apikey_header(&self) -> NgsiResult<(String, String)> {
        let name = self
            .idm
            .header_name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| NgsiError::new("getAuthHeader", 2, "headerName not found"))?;

        let value = match (&self.idm.header_value, &self.idm.header_env_value) {
            (Some(value), _) if !value.is_empty() => value.clone(),
            (_, Some(var)) if !var.is_empty() => std::env::var(var).unwrap_or_default(),
            _ => String::new(),
        };

        Ok((name, value))
    }
}

#[async_trait]
impl AuthHeaderProvider for TokenManager {
    async fn auth_header(&mut self) -> NgsiResult<(String, String)> {
        let idm_type: IdmType = self.idm.idm_type.parse()?;

        match idm_type {
            IdmType::Basic => self.basic_header(),
            IdmType::Apikey => self.apikey_header(),
            _ => {
                let token = self
                    .token(idm_type)
                    .await
                    .map_err(|e| NgsiError::wrap("getAuthHeader", 3, e))?;
                Ok(("Authorization".to_string(), format!("Bearer {}", token)))
            }
        }
    }
}

fn form(pairs: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn parse_oauth_token(stage: &'static str, body: &[u8]) -> NgsiResult<CachedToken> {
    let token: OauthToken =
        serde_json::from_slice(body).map_err(|e| NgsiError::with_source(stage, 8, e))?;

    Ok(CachedToken {
        access_token: token.access_token,
        refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        expires_at: Utc::now() + Duration::seconds(token.expires_in),
    })
}
