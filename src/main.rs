//! Fleet CLI - Panel, Node agent and provisioning tools
//!
//! One binary for every role: `fleet panel` runs the control plane and the
//! dashboard API, `fleet node` runs the agent on a tunnel host, and the `ca`
//! and `hash-password` commands prepare the material both of them need.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_api::{ApiServer, ApiServerConfig, AppState};
use fleet_auth::{hash_password, AdminCredentials, JwtValidator};
use fleet_control::{ControlServer, FleetRegistry, PanelConfigFile};
use fleet_node::{run_node, NodeConfigFile};
use fleet_trust::{CertificateAuthority, IssueRequest, IssuedIdentity, TrustStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fleet - manage tunnels on a fleet of nodes from one panel
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(about = "Fleet - manage tunnels on a fleet of nodes from one panel")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "FLEET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the panel: node control server plus dashboard API
    #[command(long_about = r#"
Run the panel. Nodes dial the control listener over mutual TLS; operators
use the dashboard API.

EXAMPLES:
  fleet panel --config /etc/fleet/panel.yml
  fleet panel --config panel.yml --api-listen 127.0.0.1:8080 --cors

ENVIRONMENT VARIABLES:
  FLEET_PANEL_CONFIG     Path to panel.yml
  FLEET_CONTROL_LISTEN   Control listener address
  FLEET_API_LISTEN       Dashboard API address
  FLEET_PANEL_DATA_DIR   Registry snapshot directory
    "#)]
    Panel {
        /// Panel configuration file
        #[arg(short, long, env = "FLEET_PANEL_CONFIG")]
        config: PathBuf,

        /// Override control_listen
        #[arg(long, env = "FLEET_CONTROL_LISTEN")]
        control_listen: Option<SocketAddr>,

        /// Override api_listen
        #[arg(long, env = "FLEET_API_LISTEN")]
        api_listen: Option<SocketAddr>,

        /// Override data_dir
        #[arg(long, env = "FLEET_PANEL_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Allow dashboard requests from localhost origins
        #[arg(long)]
        cors: bool,
    },

    /// Run the node agent on a tunnel host
    #[command(long_about = r#"
Run the node agent. It dials the panel, applies the tunnels the panel pushes
and serves a read-only status API.

EXAMPLES:
  fleet node --config /etc/fleet/node.yml
  fleet node --config node.yml --panel panel.example.com:7443 --data-dir ./data

ENVIRONMENT VARIABLES:
  FLEET_NODE_CONFIG      Path to node.yml
  FLEET_PANEL            Panel control address (host:port)
  FLEET_NODE_API_LISTEN  Status API address
  FLEET_DATA_DIR         Journal, desired state and tunnel logs
    "#)]
    Node {
        /// Node configuration file
        #[arg(short, long, env = "FLEET_NODE_CONFIG")]
        config: PathBuf,

        /// Override panel_address
        #[arg(long, env = "FLEET_PANEL")]
        panel: Option<String>,

        /// Override api_listen
        #[arg(long, env = "FLEET_NODE_API_LISTEN")]
        api_listen: Option<SocketAddr>,

        /// Override data_dir
        #[arg(long, env = "FLEET_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Leave forwarders running when the node exits
        #[arg(long)]
        keep_tunnels: bool,
    },

    /// Certificate authority and identity certificates
    Ca {
        #[command(subcommand)]
        command: CaCommands,
    },

    /// Hash the dashboard admin password for panel.yml
    #[command(long_about = r#"
Print an argon2id hash for auth.admin_password_hash. The password is read
from --password, FLEET_ADMIN_PASSWORD, or the first line of stdin.

EXAMPLES:
  echo 'correct horse' | fleet hash-password
    "#)]
    HashPassword {
        #[arg(long, env = "FLEET_ADMIN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CaCommands {
    /// Create the deployment CA (ca.pem, ca.key)
    Init {
        /// Directory for ca.pem and ca.key
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// CA common name
        #[arg(long, default_value = "Fleet CA")]
        name: String,

        /// Replace an existing CA
        #[arg(long)]
        force: bool,
    },

    /// Issue an identity certificate (CN = node id or panel name)
    #[command(long_about = r#"
Issue an identity certificate signed by the deployment CA. For nodes the
name is the node id. For the panel, add every DNS name or IP the nodes dial.

EXAMPLES:
  fleet ca issue --name panel --san panel.example.com --san 203.0.113.10
  fleet ca issue --name edge-fra-1
    "#)]
    Issue {
        /// Common name
        #[arg(long)]
        name: String,

        /// Subject alternative name (repeatable)
        #[arg(long)]
        san: Vec<String>,

        /// Directory holding ca.pem and ca.key
        #[arg(long, default_value = ".")]
        ca_dir: PathBuf,

        /// Directory for <name>.pem and <name>.key
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Validity in days
        #[arg(long, default_value = "825")]
        days: i64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

async fn run_panel(
    config_path: &Path,
    control_listen: Option<SocketAddr>,
    api_listen: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
    cors: bool,
) -> Result<()> {
    let mut config = PanelConfigFile::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(addr) = control_listen {
        config.control_listen = addr;
    }
    if let Some(addr) = api_listen {
        config.api_listen = addr;
    }
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    config.validate()?;

    fleet_trust::ensure_crypto_provider();
    let trust = Arc::new(
        TrustStore::load(&config.trust_paths()).context("Failed to load panel certificates")?,
    );
    info!(
        identity = %trust.identity().common_name,
        not_after = %trust.identity().not_after,
        "Loaded panel identity"
    );

    let credentials =
        AdminCredentials::new(&config.auth.admin_username, &config.auth.admin_password_hash)
            .context("Invalid auth.admin_password_hash")?;
    let registry = Arc::new(
        FleetRegistry::open(config.registry_config(), &config.data_dir).with_context(|| {
            format!("Failed to open registry in {}", config.data_dir.display())
        })?,
    );

    let control = ControlServer::bind(
        config.control_server_config(),
        trust.clone(),
        registry.clone(),
    )
    .await
    .context("Failed to start control server")?;

    let api = ApiServer::new(
        ApiServerConfig {
            bind_addr: config.api_listen,
            enable_cors: cors,
        },
        AppState {
            registry,
            credentials,
            jwt: Arc::new(JwtValidator::new(config.auth.jwt_secret.as_bytes())),
            token_ttl: chrono::Duration::hours(config.auth.token_ttl_hours as i64),
            ca_pem: trust.ca_pem().to_string(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_task = tokio::spawn(control.run(shutdown_rx.clone()));
    let api_task = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(api.start(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        }))
    };

    info!(
        control = %config.control_listen,
        api = %config.api_listen,
        "Panel running"
    );
    shutdown_signal().await;
    shutdown_tx.send_replace(true);

    control_task
        .await
        .context("Control server task panicked")?
        .context("Control server failed")?;
    api_task
        .await
        .context("API server task panicked")?
        .context("API server failed")?;

    info!("Panel stopped");
    Ok(())
}

async fn run_node_command(
    config_path: &Path,
    panel: Option<String>,
    api_listen: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
    keep_tunnels: bool,
) -> Result<()> {
    let mut config = NodeConfigFile::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(panel) = panel {
        config.panel_address = panel;
    }
    if let Some(addr) = api_listen {
        config.api_listen = addr;
    }
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if keep_tunnels {
        config.keep_tunnels_on_shutdown = true;
    }
    config.validate()?;

    info!(
        panel = %config.panel_address,
        api = %config.api_listen,
        data_dir = %config.data_dir.display(),
        "Starting node"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut node = tokio::spawn(run_node(config, shutdown_rx));

    tokio::select! {
        result = &mut node => {
            // Only startup failures end the node without a signal
            result.context("Node task panicked")??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    shutdown_tx.send_replace(true);
    node.await.context("Node task panicked")??;
    Ok(())
}

fn ca_init(out_dir: &Path, name: &str, force: bool) -> Result<()> {
    let cert_path = out_dir.join("ca.pem");
    let key_path = out_dir.join("ca.key");
    if !force && (cert_path.exists() || key_path.exists()) {
        anyhow::bail!(
            "{} already exists (use --force to replace the CA; every issued certificate becomes invalid)",
            cert_path.display()
        );
    }

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let ca = CertificateAuthority::generate(name).context("Failed to generate CA")?;
    IssuedIdentity {
        cert_pem: ca.cert_pem(),
        key_pem: ca.key_pem(),
    }
    .save_to_files(&cert_path, &key_path)
    .context("Failed to write CA files")?;

    println!("CA certificate: {}", cert_path.display());
    println!("CA key:         {} (keep this offline)", key_path.display());
    Ok(())
}

fn ca_issue(name: &str, sans: Vec<String>, ca_dir: &Path, out_dir: &Path, days: i64) -> Result<()> {
    let read = |file: &str| {
        let path = ca_dir.join(file);
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    };
    let ca = CertificateAuthority::from_pem(&read("ca.pem")?, &read("ca.key")?)
        .context("Failed to load CA")?;

    let mut request = IssueRequest::new(name).valid_for_days(days);
    for san in sans {
        request = request.with_san(san);
    }
    let issued = ca.issue(&request).context("Failed to issue certificate")?;

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let cert_path = out_dir.join(format!("{}.pem", name));
    let key_path = out_dir.join(format!("{}.key", name));
    issued
        .save_to_files(&cert_path, &key_path)
        .context("Failed to write certificate files")?;

    println!("Certificate: {}", cert_path.display());
    println!("Key:         {}", key_path.display());
    Ok(())
}

fn hash_password_command(password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => {
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("Failed to read password from stdin")?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }

    println!("{}", hash_password(&password)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Panel {
            config,
            control_listen,
            api_listen,
            data_dir,
            cors,
        } => run_panel(&config, control_listen, api_listen, data_dir, cors).await,
        Commands::Node {
            config,
            panel,
            api_listen,
            data_dir,
            keep_tunnels,
        } => run_node_command(&config, panel, api_listen, data_dir, keep_tunnels).await,
        Commands::Ca { command } => match command {
            CaCommands::Init {
                out_dir,
                name,
                force,
            } => ca_init(&out_dir, &name, force),
            CaCommands::Issue {
                name,
                san,
                ca_dir,
                out_dir,
                days,
            } => ca_issue(&name, san, &ca_dir, &out_dir, days),
        },
        Commands::HashPassword { password } => hash_password_command(password),
    }
}
