//! Node configuration file (`node.yml`)

use crate::agent::AgentConfig;
use crate::reconcile::{ReconcilerConfig, RetryPolicy};
use crate::supervisor::{
    CommandLauncher, GostLauncher, HostNetwork, Launcher, SupervisorConfig, SystemNetwork,
};
use fleet_channel::ReconnectConfig;
use fleet_proto::NodeAnnounce;
use fleet_trust::TrustPaths;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Certificate material of the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTlsConfig {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// How forwarders are launched. `command` wins over `binary`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// gost binary (default `/usr/local/bin/gost`, then `$PATH`)
    #[serde(default)]
    pub binary: Option<PathBuf>,
    /// Shell template with `{tunnel_id}`, `{local_port}`, `{remote_target}`, `{mode}`
    #[serde(default)]
    pub command: Option<String>,
}

/// ```yaml
/// panel_address: panel.example.com:7443
/// panel_server_name: panel.example.com
/// api_listen: 127.0.0.1:8081
/// data_dir: /var/lib/fleet-node
/// tls:
///   ca_cert: /etc/fleet/ca.pem
///   cert: /etc/fleet/node.pem
///   key: /etc/fleet/node.key
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigFile {
    pub panel_address: String,
    /// Defaults to the host part of `panel_address`
    #[serde(default)]
    pub panel_server_name: Option<String>,
    #[serde(default = "default_api_listen")]
    pub api_listen: SocketAddr,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub tls: NodeTlsConfig,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    #[serde(default = "default_teardown_grace_secs")]
    pub teardown_grace_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    /// Turn on `net.ipv4.ip_forward` before starting tunnels
    #[serde(default = "default_true")]
    pub manage_ip_forward: bool,
    /// Leave forwarders running when the node process exits
    #[serde(default)]
    pub keep_tunnels_on_shutdown: bool,
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-node")
}

fn default_reconcile_interval_secs() -> u64 {
    10
}

fn default_retry_budget() -> u32 {
    5
}

fn default_max_concurrent_ops() -> usize {
    4
}

fn default_startup_grace_ms() -> u64 {
    1500
}

fn default_teardown_grace_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl NodeConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfigFile = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_address(&self.panel_address, "panel")?;
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconcile_interval_secs must be > 0".into(),
            ));
        }
        if self.retry_budget == 0 {
            return Err(ConfigError::Invalid("retry_budget must be > 0".into()));
        }
        if self.max_concurrent_ops == 0 {
            return Err(ConfigError::Invalid("max_concurrent_ops must be > 0".into()));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be > 0".into(),
            ));
        }
        if let Some(command) = &self.forwarder.command {
            if !command.contains("{local_port}") {
                return Err(ConfigError::Invalid(
                    "forwarder.command must use {local_port}".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn server_name(&self) -> String {
        self.panel_server_name.clone().unwrap_or_else(|| {
            self.panel_address
                .rsplit_once(':')
                .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
                .unwrap_or(&self.panel_address)
                .to_string()
        })
    }

    pub fn trust_paths(&self) -> TrustPaths {
        TrustPaths {
            ca_cert: self.tls.ca_cert.clone(),
            cert: self.tls.cert.clone(),
            key: self.tls.key.clone(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(&self.data_dir);
        config.startup_grace = Duration::from_millis(self.startup_grace_ms);
        config.teardown_grace = Duration::from_secs(self.teardown_grace_secs);
        config
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            max_concurrent_ops: self.max_concurrent_ops,
            retry: RetryPolicy {
                budget: self.retry_budget,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut announce = NodeAnnounce {
            api_address: self.api_listen.to_string(),
            ..NodeAnnounce::default()
        };
        if let Some(name) = &self.display_name {
            announce.display_name = name.clone();
        }

        AgentConfig {
            panel_addr: self.panel_address.clone(),
            server_name: self.server_name(),
            announce,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn launcher(&self) -> Arc<dyn Launcher> {
        match &self.forwarder.command {
            Some(template) => Arc::new(CommandLauncher::new(template.clone())),
            None => Arc::new(GostLauncher::new(self.forwarder.binary.clone())),
        }
    }

    pub fn host_network(&self) -> Arc<dyn HostNetwork> {
        if self.manage_ip_forward {
            Arc::new(SystemNetwork::new())
        } else {
            Arc::new(SystemNetwork::without_ip_forward())
        }
    }
}

/// Check a `host:port` address
pub fn validate_address(addr: &str, kind: &str) -> Result<(), ConfigError> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(ConfigError::Invalid(format!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            kind, addr
        )));
    };

    if host.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            kind, addr
        )));
    }

    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "Invalid port in {} address: {}",
            kind, addr
        ))),
    }
}
