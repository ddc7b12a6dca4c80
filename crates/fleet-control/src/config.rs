//! Panel configuration file (`panel.yml`)

use crate::registry::RegistryConfig;
use crate::server::ControlServerConfig;
use fleet_channel::HandshakeConfig;
use fleet_trust::TrustPaths;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
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

/// Certificate material of the panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelTlsConfig {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Dashboard operator login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelAuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Argon2 PHC string, see `fleet hash-password`
    pub admin_password_hash: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

/// ```yaml
/// control_listen: 0.0.0.0:7443
/// api_listen: 0.0.0.0:8080
/// tls:
///   ca_cert: /etc/fleet/ca.pem
///   cert: /etc/fleet/panel.pem
///   key: /etc/fleet/panel.key
/// data_dir: /var/lib/fleet-panel
/// auth:
///   jwt_secret: change-me
///   admin_password_hash: $argon2id$v=19$...
/// heartbeat_interval_secs: 10
/// missed_heartbeats: 3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfigFile {
    #[serde(default = "default_control_listen")]
    pub control_listen: SocketAddr,
    #[serde(default = "default_api_listen")]
    pub api_listen: SocketAddr,
    /// Holds `registry.json`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub tls: PanelTlsConfig,
    pub auth: PanelAuthConfig,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_control_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7443))
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-panel")
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_token_ttl_hours() -> u64 {
    12
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_missed_heartbeats() -> u32 {
    3
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

impl PanelConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: PanelConfigFile = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.jwt_secret must not be empty".into()));
        }
        if self.auth.admin_username.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "auth.admin_username must not be empty".into(),
            ));
        }
        if self.auth.token_ttl_hours == 0 {
            return Err(ConfigError::Invalid("auth.token_ttl_hours must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("missed_heartbeats must be > 0".into()));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be > 0".into(),
            ));
        }
        if self.control_listen == self.api_listen {
            return Err(ConfigError::Invalid(format!(
                "control_listen and api_listen are both {}",
                self.control_listen
            )));
        }
        Ok(())
    }

    pub fn trust_paths(&self) -> TrustPaths {
        TrustPaths {
            ca_cert: self.tls.ca_cert.clone(),
            cert: self.tls.cert.clone(),
            key: self.tls.key.clone(),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            missed_heartbeats: self.missed_heartbeats,
        }
    }

    pub fn control_server_config(&self) -> ControlServerConfig {
        ControlServerConfig {
            bind_addr: self.control_listen,
            handshake: HandshakeConfig {
                handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
tls:
  ca_cert: /etc/fleet/ca.pem
  cert: /etc/fleet/panel.pem
  key: /etc/fleet/panel.key
auth:
  jwt_secret: test-secret
  admin_password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA"
"#;

    #[test]
    fn test_defaults_applied() {
        let config = PanelConfigFile::parse(MINIMAL).unwrap();
        assert_eq!(config.control_listen.port(), 7443);
        assert_eq!(config.api_listen.port(), 8080);
        assert_eq!(config.auth.admin_username, "admin");
        assert_eq!(config.auth.token_ttl_hours, 12);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fleet-panel"));

        let registry = config.registry_config();
        assert_eq!(registry.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(registry.missed_heartbeats, 3);

        let server = config.control_server_config();
        assert_eq!(server.handshake.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_zero_heartbeat() {
        let content = format!("{}heartbeat_interval_secs: 0\n", MINIMAL);
        assert!(matches!(
            PanelConfigFile::parse(&content),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_empty_secret() {
        let content = MINIMAL.replace("test-secret", "\"\"");
        assert!(matches!(
            PanelConfigFile::parse(&content),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_tls_section_fails_to_parse() {
        let content = "auth:\n  jwt_secret: x\n  admin_password_hash: y\n";
        assert!(matches!(
            PanelConfigFile::parse(content),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let result = PanelConfigFile::load(Path::new("/nonexistent/panel.yml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
