//! hzn - hub and control plane of the connectivity fabric
//!
//! `hzn hub` accepts agent connections and registers their services with the
//! control plane; `hzn control` keeps the service records and pushes them to
//! every hub.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hzn_auth::{Role, TokenClaims, TokenCreator, TokenValidator};
use hzn_control::rpc::serve_connection;
use hzn_control::{tls, Broadcaster, ConnectionPool, ControlServer, RpcControlClient, StaticCatalog};
use hzn_hub::{Hub, HubConfig, LogHandler};
use hzn_mux::MuxConfig;
use hzn_proto::{Account, HubId, ALPN_RPC};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "hzn")]
#[command(about = "Run a hzn hub or control plane")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent connections and route their services
    Hub {
        /// Address agents and the control plane connect to
        #[arg(long, env = "HZN_LISTEN", default_value = "0.0.0.0:4443")]
        listen: String,

        /// TLS certificate chain (PEM)
        #[arg(long, env = "HZN_CERT")]
        cert: PathBuf,

        /// TLS private key (PEM)
        #[arg(long, env = "HZN_KEY")]
        key: PathBuf,

        /// Control plane address (host:port)
        #[arg(long, env = "HZN_CONTROL_ADDR")]
        control_addr: String,

        /// This hub's token for calls to the control plane
        #[arg(long, env = "HZN_TOKEN")]
        token: String,

        /// Control plane public key (PEM) that tokens are checked against
        #[arg(long, env = "HZN_TOKEN_PUB")]
        token_pub: PathBuf,

        /// Hub identity (random if not set)
        #[arg(long, env = "HZN_HUB_ID")]
        hub_id: Option<Uuid>,

        /// Certificate (PEM) to pin for the control plane instead of the web PKI
        #[arg(long, env = "HZN_CONTROL_CERT")]
        control_cert: Option<PathBuf>,
    },

    /// Keep service records and broadcast them to hubs
    Control {
        #[arg(long, env = "HZN_LISTEN", default_value = "0.0.0.0:24403")]
        listen: String,

        /// TLS certificate chain (PEM)
        #[arg(long, env = "HZN_CERT")]
        cert: PathBuf,

        /// TLS private key (PEM)
        #[arg(long, env = "HZN_KEY")]
        key: PathBuf,

        /// Public key (PEM) hub tokens are checked against
        #[arg(long, env = "HZN_TOKEN_PUB")]
        token_pub: PathBuf,

        /// Hub to broadcast to (repeatable, host:port)
        #[arg(long = "hub", env = "HZN_HUBS", value_delimiter = ',')]
        hubs: Vec<String>,

        /// Control token presented to hubs
        #[arg(long, env = "HZN_TOKEN")]
        token: String,

        /// Certificate (PEM) to pin for hubs instead of the web PKI
        #[arg(long, env = "HZN_HUB_CERT")]
        hub_cert: Option<PathBuf>,
    },

    /// Issue a signed token
    Token {
        /// Ed25519 private key (PKCS#8 PEM)
        #[arg(long, env = "HZN_SIGNING_KEY")]
        signing_key: PathBuf,

        #[arg(long, default_value = "/")]
        namespace: String,

        #[arg(long)]
        account: String,

        #[arg(long, value_enum, default_value = "agent")]
        role: RoleArg,

        /// Capability to grant (repeatable, e.g. hzn:serve)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Control,
    Agent,
    Hub,
    Manage,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Control => Role::Control,
            RoleArg::Agent => Role::Agent,
            RoleArg::Hub => Role::Hub,
            RoleArg::Manage => Role::Manage,
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {} from {}", what, path.display()))
}

fn tls_acceptor(cert: &Path, key: &Path, alpn: &[&[u8]]) -> Result<TlsAcceptor> {
    let certs = tls::load_certs(cert).context("Failed to load TLS certificate")?;
    let key = tls::load_private_key(key).context("Failed to load TLS key")?;
    let config = tls::server_config(certs, key, alpn).context("Invalid TLS configuration")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn wait_for_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Error listening for shutdown signal: {}", e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_hub(
    listen: String,
    cert: PathBuf,
    key: PathBuf,
    control_addr: String,
    token: String,
    token_pub: PathBuf,
    hub_id: Option<Uuid>,
    control_cert: Option<PathBuf>,
) -> Result<()> {
    let hub_id = HubId(hub_id.unwrap_or_else(Uuid::new_v4));
    let config = HubConfig::new(hub_id);

    let token_pub = read_file(&token_pub, "token public key")?;
    let validator = TokenValidator::from_ed_pem(&token_pub).context("Invalid token public key")?;

    let control_cert = control_cert
        .map(|path| read_file(&path, "control plane certificate"))
        .transpose()?;
    let pool = ConnectionPool::new(Some(token), control_cert.as_deref())
        .context("Failed to set up control plane connections")?;
    let control = RpcControlClient::new(Arc::new(pool), control_addr.clone(), hub_id);

    let acceptor = tls_acceptor(&cert, &key, &config.alpn_protocols())?;
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    info!(hub_id = %hub_id.0, control = %control_addr, "Hub starting on {}", listen);

    let hub = Arc::new(Hub::new(
        config,
        Arc::new(control),
        validator,
        Arc::new(LogHandler),
    ));
    let serving = tokio::spawn(hub.clone().serve(listener, acceptor));

    wait_for_signal().await;
    hub.shutdown();

    info!("Waiting for open streams to finish");
    hub.wait_to_drain().await;
    match serving.await {
        Ok(result) => result.context("Hub listener failed")?,
        Err(e) => error!("Hub listener task failed: {}", e),
    }

    info!("Hub stopped");
    Ok(())
}

async fn run_control(
    listen: String,
    cert: PathBuf,
    key: PathBuf,
    token_pub: PathBuf,
    hubs: Vec<String>,
    token: String,
    hub_cert: Option<PathBuf>,
) -> Result<()> {
    let token_pub = read_file(&token_pub, "token public key")?;
    let validator = TokenValidator::from_ed_pem(&token_pub).context("Invalid token public key")?;

    let hub_cert = hub_cert
        .map(|path| read_file(&path, "hub certificate"))
        .transpose()?;
    let pool = ConnectionPool::new(Some(token), hub_cert.as_deref())
        .context("Failed to set up hub connections")?;

    info!(hubs = hubs.len(), "Broadcasting to {:?}", hubs);
    let broadcaster = Broadcaster::new(Arc::new(StaticCatalog::new(hubs)), Arc::new(pool));
    let control = Arc::new(ControlServer::new(validator, Arc::new(broadcaster)));

    let acceptor = tls_acceptor(&cert, &key, &[ALPN_RPC])?;
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Control plane listening on {}", listen);

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    let mux = MuxConfig::default();

    let accepting = {
        let shutdown = shutdown.clone();
        let tracker = tracker.clone();
        async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                let (tcp, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let control = control.clone();
                let mux = mux.clone();
                tracker.spawn(async move {
                    let stream = match acceptor.accept(tcp).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(%peer, "TLS handshake failed: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = serve_connection(stream, control, mux).await {
                        debug!(%peer, "RPC connection ended: {}", e);
                    }
                });
            }
        }
    };
    let accepting = tokio::spawn(accepting);

    wait_for_signal().await;
    shutdown.cancel();
    let _ = accepting.await;
    tracker.close();

    // Hubs keep their connections open; don't wait on them forever.
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        info!("Closing remaining hub connections");
    }

    info!("Control plane stopped");
    Ok(())
}

fn issue_token(
    signing_key: &Path,
    account: Account,
    role: Role,
    capabilities: Vec<String>,
    hours: i64,
) -> Result<String> {
    let key = read_file(signing_key, "signing key")?;
    let creator = TokenCreator::from_ed_pem(&key).context("Invalid signing key")?;

    let claims = capabilities.into_iter().fold(
        TokenClaims::new(account, role, chrono::Duration::hours(hours)),
        |claims, capability| claims.with_capability(capability),
    );

    creator.create(&claims).context("Failed to sign token")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Hub {
            listen,
            cert,
            key,
            control_addr,
            token,
            token_pub,
            hub_id,
            control_cert,
        } => {
            run_hub(
                listen,
                cert,
                key,
                control_addr,
                token,
                token_pub,
                hub_id,
                control_cert,
            )
            .await
        }
        Commands::Control {
            listen,
            cert,
            key,
            token_pub,
            hubs,
            token,
            hub_cert,
        } => run_control(listen, cert, key, token_pub, hubs, token, hub_cert).await,
        Commands::Token {
            signing_key,
            namespace,
            account,
            role,
            capabilities,
            hours,
        } => {
            let token = issue_token(
                &signing_key,
                Account::new(namespace, account),
                role.into(),
                capabilities,
                hours,
            )?;
            println!("{}", token);
            Ok(())
        }
    }
}
