//! Broker and identity-manager settings

use url::Url;

use crate::error::{NgsiError, NgsiResult};

/// Upstream context broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL, e.g. `http://orion:1026`
    pub url: Url,
    /// Credentials for the broker, if it sits behind an identity manager
    pub idm: Option<IdmConfig>,
}

impl BrokerConfig {
    pub fn builder(url: &str) -> BrokerConfigBuilder {
        BrokerConfigBuilder {
            url: url.to_string(),
            idm: None,
        }
    }

    /// `true` when requests need an extra auth header
    pub fn requires_auth(&self) -> bool {
        self.idm.as_ref().map_or(false, |idm| !idm.idm_type.is_empty())
    }
}

/// Builder for BrokerConfig
#[derive(Debug)]
pub struct BrokerConfigBuilder {
    url: String,
    idm: Option<IdmConfig>,
}

impl BrokerConfigBuilder {
    pub fn idm(mut self, idm: IdmConfig) -> Self {
        self.idm = Some(idm);
        self
    }

    pub fn build(self) -> NgsiResult<BrokerConfig> {
        let url = Url::parse(&self.url).map_err(|e| NgsiError::with_source("brokerConfig", 1, e))?;
        Ok(BrokerConfig { url, idm: self.idm })
    }
}

/// Identity-manager settings for one broker.
///
/// `idm_type` is kept as given; it is only interpreted when a token is
/// needed, so an unknown type shows up as a per-request error.
#[derive(Debug, Clone, Default)]
pub struct IdmConfig {
    pub idm_type: String,
    pub idm_host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Header name for `apikey`
    pub header_name: Option<String>,
    pub header_value: Option<String>,
    /// Environment variable holding the `apikey` header value
    pub header_env_value: Option<String>,
}

impl IdmConfig {
    pub fn new(idm_type: &str) -> Self {
        Self {
            idm_type: idm_type.to_string(),
            ..Self::default()
        }
    }

    pub fn idm_host(mut self, host: &str) -> Self {
        self.idm_host = Some(host.to_string());
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn client(mut self, client_id: &str, client_secret: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self.client_secret = Some(client_secret.to_string());
        self
    }

    pub fn api_key(mut self, name: &str, value: &str) -> Self {
        self.header_name = Some(name.to_string());
        self.header_value = Some(value.to_string());
        self
    }
}
