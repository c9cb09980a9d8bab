//! NGSI Core - shared plumbing for the NGSI proxies
//!
//! The proxies in `ngsi-proxy` are thin HTTP front-ends. Everything they
//! share lives here:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  ProxyStats  │   │ TokenManager │   │ HttpTransport│
//! │  counters +  │   │ cached token │   │  (reqwest)   │
//! │  uptime      │   │ per broker   │   │              │
//! └──────────────┘   └──────┬───────┘   └──────▲───────┘
//!                           └──────────────────┘
//! ```
//!
//! - [`stats`]: request counters behind their own lock
//! - [`auth`]: auth header provider for brokers behind an identity manager
//! - [`transport`]: upstream HTTP seam
//! - [`error`]: stage-tagged errors rendered as `<stage><NNN> <message>`

pub mod auth;
pub mod config;
pub mod error;
pub mod json;
pub mod stats;
pub mod transport;

pub use auth::{AuthHeaderProvider, IdmType, TokenManager};
pub use config::{BrokerConfig, BrokerConfigBuilder, IdmConfig};
pub use error::{NgsiError, NgsiResult};
pub use stats::{humanize_uptime, Outcome, ProxyStats, StatsSnapshot};
pub use transport::{HttpTransport, OutboundRequest, ReqwestTransport, UpstreamResponse};

/// Version reported on `/health`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
