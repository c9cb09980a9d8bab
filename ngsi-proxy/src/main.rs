//! NGSI Proxy Binary
//!
//! ## Usage
//!
//! ```bash
//! # Query proxy in front of Orion
//! ngsi-proxy queryproxy server --host http://orion:1026
//!
//! # Geo proxy on a custom path, broker behind Keyrock
//! ngsi-proxy geoproxy server --host http://orion:1026 --replaceURL /v2/geo \
//!     --idmType keyrock --idmHost http://keyrock:3000 \
//!     --username admin@test.com --password 1234 \
//!     --clientId a1a6048b --clientSecret e4cc0147
//!
//! # Token proxy
//! ngsi-proxy tokenproxy server --idmHost http://keyrock:3000 \
//!     --clientId a1a6048b --clientSecret e4cc0147
//!
//! # Ask a running proxy how it is doing
//! ngsi-proxy tokenproxy health --host http://localhost:1029 --pretty
//!
//! # Print notifications
//! ngsi-proxy receiver --port 1028 --pretty --header
//! ```

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use ngsi_core::{BrokerConfig, HttpTransport, IdmConfig, NgsiResult, ReqwestTransport};
use ngsi_proxy::{
    health, Flavor, ListenConfig, QueryProxy, QueryProxyConfig, Receiver, ReceiverConfig,
    ReceiverState, TokenProxy, TokenProxyConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ngsi-proxy")]
#[command(about = "Proxies and a notification receiver for FIWARE brokers")]
#[command(version)]
struct Cli {
    /// Upstream request timeout in milliseconds (0 disables it)
    #[arg(long, global = true, env = "NGSI_PROXY_TIMEOUT_MS", default_value_t = 30000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query proxy: POST a form, GET /v2/entities
    Queryproxy {
        #[command(subcommand)]
        action: QueryAction,
    },
    /// Geo proxy: same as the query proxy, for geo queries
    Geoproxy {
        #[command(subcommand)]
        action: GeoAction,
    },
    /// Token proxy holding IdM client credentials
    Tokenproxy {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Print notifications sent by a broker
    Receiver(ReceiverArgs),
}

#[derive(Subcommand, Debug)]
enum QueryAction {
    /// Start the query proxy
    Server {
        /// Listen host
        #[arg(long, env = "NGSI_PROXY_QHOST", default_value = "0.0.0.0")]
        qhost: String,
        #[command(flatten)]
        proxy: BrokerProxyArgs,
    },
    /// Health of a running query proxy
    Health(HealthArgs),
}

#[derive(Subcommand, Debug)]
enum GeoAction {
    /// Start the geo proxy
    Server {
        /// Listen host
        #[arg(long, env = "NGSI_PROXY_GHOST", default_value = "0.0.0.0")]
        ghost: String,
        #[command(flatten)]
        proxy: BrokerProxyArgs,
    },
    /// Health of a running geo proxy
    Health(HealthArgs),
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    /// Start the token proxy
    Server(TokenServerArgs),
    /// Health of a running token proxy
    Health(HealthArgs),
}

/// Flags shared by the query and geo proxies
#[derive(Args, Debug)]
struct BrokerProxyArgs {
    /// Broker URL
    #[arg(long = "host", env = "NGSI_PROXY_BROKER")]
    broker: String,

    /// Path the proxy accepts queries on
    #[arg(long = "replaceURL", env = "NGSI_PROXY_REPLACE_URL", default_value = "/v2/ex/entities")]
    replace_url: String,

    #[arg(long, env = "NGSI_PROXY_PORT", default_value_t = 1030)]
    port: u16,

    #[command(flatten)]
    tls: TlsArgs,

    #[command(flatten)]
    idm: IdmArgs,

    /// Log upstream responses
    #[arg(short, long, env = "NGSI_PROXY_VERBOSE")]
    verbose: bool,
}

#[derive(Args, Debug)]
struct TlsArgs {
    /// Serve over HTTPS
    #[arg(long, env = "NGSI_PROXY_HTTPS")]
    https: bool,

    /// Private key file
    #[arg(long, env = "NGSI_PROXY_KEY")]
    key: Option<String>,

    /// Certificate file
    #[arg(long, env = "NGSI_PROXY_CERT")]
    cert: Option<String>,
}

/// How the proxy authenticates to the broker
#[derive(Args, Debug)]
struct IdmArgs {
    #[arg(long = "idmType", env = "NGSI_PROXY_IDM_TYPE")]
    idm_type: Option<String>,

    #[arg(long = "idmHost", env = "NGSI_PROXY_IDM_HOST")]
    idm_host: Option<String>,

    #[arg(long, env = "NGSI_PROXY_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "NGSI_PROXY_PASSWORD")]
    password: Option<String>,

    #[arg(long = "clientId", env = "NGSI_PROXY_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long = "clientSecret", env = "NGSI_PROXY_CLIENT_SECRET")]
    client_secret: Option<String>,

    #[arg(long = "headerName", env = "NGSI_PROXY_HEADER_NAME")]
    header_name: Option<String>,

    #[arg(long = "headerValue", env = "NGSI_PROXY_HEADER_VALUE")]
    header_value: Option<String>,

    #[arg(long = "headerEnvValue", env = "NGSI_PROXY_HEADER_ENV_VALUE")]
    header_env_value: Option<String>,
}

impl IdmArgs {
    fn into_config(self) -> Option<IdmConfig> {
        let idm_type = self.idm_type?;
        Some(IdmConfig {
            idm_type,
            idm_host: self.idm_host,
            username: self.username,
            password: self.password,
            client_id: self.client_id,
            client_secret: self.client_secret,
            header_name: self.header_name,
            header_value: self.header_value,
            header_env_value: self.header_env_value,
        })
    }
}

#[derive(Args, Debug)]
struct TokenServerArgs {
    /// Listen host
    #[arg(long, env = "NGSI_PROXY_LISTEN_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "NGSI_PROXY_PORT", default_value_t = 1029)]
    port: u16,

    /// Identity manager URL
    #[arg(long = "idmHost", env = "NGSI_PROXY_IDM_HOST")]
    idm_host: String,

    #[arg(long = "clientId", env = "NGSI_PROXY_CLIENT_ID")]
    client_id: String,

    #[arg(long = "clientSecret", env = "NGSI_PROXY_CLIENT_SECRET")]
    client_secret: String,

    #[command(flatten)]
    tls: TlsArgs,

    /// Log passwords and upstream responses
    #[arg(short, long, env = "NGSI_PROXY_VERBOSE")]
    verbose: bool,
}

#[derive(Args, Debug)]
struct HealthArgs {
    /// URL of the running proxy
    #[arg(long, env = "NGSI_PROXY_URL")]
    host: String,

    /// Indent the JSON report
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct ReceiverArgs {
    #[arg(long, env = "NGSI_PROXY_LISTEN_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "NGSI_PROXY_PORT", default_value_t = 1028)]
    port: u16,

    /// Path notifications are POSTed to
    #[arg(long, env = "NGSI_PROXY_RECEIVER_URL", default_value = "/")]
    url: String,

    /// Indent JSON notifications
    #[arg(long)]
    pretty: bool,

    /// Print request headers before each notification
    #[arg(long)]
    header: bool,

    #[command(flatten)]
    tls: TlsArgs,

    /// Print the receiver URL at start-up
    #[arg(short, long, env = "NGSI_PROXY_VERBOSE")]
    verbose: bool,
}

fn listen_config(host: String, port: u16, tls: TlsArgs) -> ListenConfig {
    let listen = ListenConfig {
        host,
        port,
        ..ListenConfig::default()
    };
    if tls.https {
        listen.tls(tls.key, tls.cert)
    } else {
        listen
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout belongs to receiver and health output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ngsi_proxy=info,ngsi_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{}", e.display_diagnostic());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> NgsiResult<()> {
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(cli.timeout_ms)?);

    match cli.command {
        Command::Queryproxy { action } => match action {
            QueryAction::Server { qhost, proxy } => {
                serve_query(Flavor::Query, qhost, proxy, transport).await
            }
            QueryAction::Health(args) => health_command(Flavor::Query.health_command_stage(), args, transport).await,
        },
        Command::Geoproxy { action } => match action {
            GeoAction::Server { ghost, proxy } => serve_query(Flavor::Geo, ghost, proxy, transport).await,
            GeoAction::Health(args) => health_command(Flavor::Geo.health_command_stage(), args, transport).await,
        },
        Command::Tokenproxy { action } => match action {
            TokenAction::Server(args) => {
                let listen = listen_config(args.host, args.port, args.tls);
                let config = TokenProxyConfig {
                    idm_host: args.idm_host,
                    client_id: args.client_id,
                    client_secret: args.client_secret,
                    verbose: args.verbose,
                };
                tracing::info!("Starting token proxy v{}", ngsi_core::VERSION);
                TokenProxy::new(config, transport)?.run(&listen).await
            }
            TokenAction::Health(args) => health_command("tokenProxyHealth", args, transport).await,
        },
        Command::Receiver(args) => {
            let listen = listen_config(args.host, args.port, args.tls);
            let config = ReceiverConfig {
                path: args.url,
                pretty: args.pretty,
                header: args.header,
                verbose: args.verbose,
            };
            let state = ReceiverState::stdio(&config);
            Receiver::new(config, state).run(&listen).await
        }
    }
}

async fn serve_query(
    flavor: Flavor,
    host: String,
    args: BrokerProxyArgs,
    transport: Arc<dyn HttpTransport>,
) -> NgsiResult<()> {
    let listen = listen_config(host, args.port, args.tls);

    let mut broker = BrokerConfig::builder(&args.broker);
    if let Some(idm) = args.idm.into_config() {
        broker = broker.idm(idm);
    }

    let config = QueryProxyConfig::new(flavor, broker.build()?)
        .action_path(&args.replace_url)
        .verbose(args.verbose);

    tracing::info!("Starting {} v{}", flavor.name(), ngsi_core::VERSION);
    QueryProxy::new(config, transport).run(&listen).await
}

async fn health_command(
    stage: &'static str,
    args: HealthArgs,
    transport: Arc<dyn HttpTransport>,
) -> NgsiResult<()> {
    let mut out = std::io::stdout();
    health::check_health(stage, &*transport, &args.host, args.pretty, &mut out).await
}
