//! Shared data model: desired tunnel specs, observed tunnel state and node records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Forwarding mode of a tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    Tcp,
    Udp,
    Ws,
    Grpc,
    Tcpmux,
}

/// Transport a tunnel binds its local port with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl ProtocolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolMode::Tcp => "tcp",
            ProtocolMode::Udp => "udp",
            ProtocolMode::Ws => "ws",
            ProtocolMode::Grpc => "grpc",
            ProtocolMode::Tcpmux => "tcpmux",
        }
    }

    /// Transport used by the listening side
    pub fn transport(&self) -> Transport {
        match self {
            ProtocolMode::Udp => Transport::Udp,
            _ => Transport::Tcp,
        }
    }

    /// Scheme used to reach the remote target
    pub fn forward_scheme(&self) -> &'static str {
        match self {
            ProtocolMode::Udp => "udp",
            _ => "tcp",
        }
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProtocolMode {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProtocolMode::Tcp),
            "udp" => Ok(ProtocolMode::Udp),
            "ws" => Ok(ProtocolMode::Ws),
            "grpc" => Ok(ProtocolMode::Grpc),
            "tcpmux" => Ok(ProtocolMode::Tcpmux),
            other => Err(SpecError::UnsupportedMode(other.to_string())),
        }
    }
}

/// Configuration-shape errors of a tunnel spec
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("tunnel_id must not be empty")]
    EmptyTunnelId,

    #[error("tunnel_id contains invalid characters: {0}")]
    InvalidTunnelId(String),

    #[error("local_port must be between 1 and 65535")]
    InvalidLocalPort,

    #[error("remote target must be host:port, got '{0}'")]
    InvalidRemoteTarget(String),

    #[error("unsupported protocol mode: {0}")]
    UnsupportedMode(String),
}

/// Desired state of one tunnel, owned by the fleet registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TunnelSpec {
    /// Unique per node
    pub tunnel_id: String,
    pub node_id: String,
    /// Port the forwarder listens on, on the node host
    pub local_port: u16,
    /// Where traffic is forwarded to (host:port)
    pub remote_target: String,
    pub mode: ProtocolMode,
    pub enabled: bool,
    /// Strictly increasing on every edit
    pub version: u64,
}

impl TunnelSpec {
    /// Check the spec is well formed. Does not touch the network.
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_tunnel_id(&self.tunnel_id)?;
        if self.local_port == 0 {
            return Err(SpecError::InvalidLocalPort);
        }
        split_host_port(&self.remote_target)?;
        Ok(())
    }

    /// Host and port of the remote target
    pub fn remote_host_port(&self) -> Result<(String, u16), SpecError> {
        split_host_port(&self.remote_target)
    }
}

/// Tunnel ids end up in file names, so keep them to a safe alphabet.
pub fn validate_tunnel_id(tunnel_id: &str) -> Result<(), SpecError> {
    if tunnel_id.is_empty() {
        return Err(SpecError::EmptyTunnelId);
    }
    let ok = tunnel_id.len() <= 128
        && tunnel_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok || tunnel_id.starts_with('.') {
        return Err(SpecError::InvalidTunnelId(tunnel_id.to_string()));
    }
    Ok(())
}

/// Split "host:port" (or "[v6]:port")
pub fn split_host_port(target: &str) -> Result<(String, u16), SpecError> {
    let invalid = || SpecError::InvalidRemoteTarget(target.to_string());

    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Observed status of a tunnel on a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Pending,
    Active,
    Failed,
    Stopped,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Pending => "pending",
            TunnelStatus::Active => "active",
            TunnelStatus::Failed => "failed",
            TunnelStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Host resource backing an active tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TunnelHandle {
    pub pid: u32,
    pub local_port: u16,
}

/// Observed state of one tunnel, written only by the node's reconciler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TunnelState {
    pub tunnel_id: String,
    /// Last version successfully applied (0 = never)
    pub applied_version: u64,
    /// Version the last attempt was made for
    pub target_version: u64,
    pub handle: Option<TunnelHandle>,
    pub status: TunnelStatus,
    pub last_error: Option<String>,
    /// Consecutive failed attempts for `target_version`
    pub attempts: u32,
    pub retry_exhausted: bool,
    pub updated_at: DateTime<Utc>,
}

impl TunnelState {
    /// Fresh state for a spec that is about to be attempted
    pub fn pending(spec: &TunnelSpec) -> Self {
        Self {
            tunnel_id: spec.tunnel_id.clone(),
            applied_version: 0,
            target_version: spec.version,
            handle: None,
            status: TunnelStatus::Pending,
            last_error: None,
            attempts: 0,
            retry_exhausted: false,
            updated_at: Utc::now(),
        }
    }

    /// State of a tunnel whose forwarder is up
    pub fn active(spec: &TunnelSpec, handle: TunnelHandle) -> Self {
        Self {
            tunnel_id: spec.tunnel_id.clone(),
            applied_version: spec.version,
            target_version: spec.version,
            handle: Some(handle),
            status: TunnelStatus::Active,
            last_error: None,
            attempts: 0,
            retry_exhausted: false,
            updated_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TunnelStatus::Active
    }
}

/// Node-side summary carried by every heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthSnapshot {
    pub tunnels_total: u32,
    pub active: u32,
    pub pending: u32,
    pub failed: u32,
    pub stopped: u32,
    pub uptime_secs: u64,
    pub agent_version: String,
    /// Highest config generation the node has accepted
    pub generation: u64,
}

impl HealthSnapshot {
    pub fn from_states(states: &[TunnelState], uptime_secs: u64, generation: u64) -> Self {
        let mut snapshot = Self {
            tunnels_total: states.len() as u32,
            uptime_secs,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            generation,
            ..Default::default()
        };
        for state in states {
            match state.status {
                TunnelStatus::Pending => snapshot.pending += 1,
                TunnelStatus::Active => snapshot.active += 1,
                TunnelStatus::Failed => snapshot.failed += 1,
                TunnelStatus::Stopped => snapshot.stopped += 1,
            }
        }
        snapshot
    }
}

/// Health of a node as seen by the panel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeHealth::Unknown => "unknown",
            NodeHealth::Healthy => "healthy",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Panel-side view of a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct NodeRecord {
    pub node_id: String,
    pub display_name: String,
    pub api_address: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub health_state: NodeHealth,
    /// Whether a control session is currently open
    pub connected: bool,
    pub last_error: Option<String>,
    /// Current desired-config generation
    pub generation: u64,
    /// Generation the node last reported applying
    pub reported_generation: u64,
    /// Tunnel states as last reported by the node
    pub tunnels: Vec<TunnelState>,
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(target: &str) -> TunnelSpec {
        TunnelSpec {
            tunnel_id: "t1".to_string(),
            node_id: "node-a".to_string(),
            local_port: 9000,
            remote_target: target.to_string(),
            mode: ProtocolMode::Tcp,
            enabled: true,
            version: 1,
        }
    }

    #[test]
    fn test_validate_accepts_host_port() {
        assert!(spec("10.0.0.5:443").validate().is_ok());
        assert!(spec("backend.internal:8080").validate().is_ok());
        assert!(spec("[::1]:22").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_target() {
        assert!(matches!(
            spec("no-port").validate(),
            Err(SpecError::InvalidRemoteTarget(_))
        ));
        assert!(matches!(
            spec("host:0").validate(),
            Err(SpecError::InvalidRemoteTarget(_))
        ));
        assert!(matches!(
            spec(":80").validate(),
            Err(SpecError::InvalidRemoteTarget(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_port_and_bad_id() {
        let mut s = spec("1.2.3.4:80");
        s.local_port = 0;
        assert_eq!(s.validate(), Err(SpecError::InvalidLocalPort));

        let mut s = spec("1.2.3.4:80");
        s.tunnel_id = "../etc".to_string();
        assert!(matches!(s.validate(), Err(SpecError::InvalidTunnelId(_))));

        s.tunnel_id = String::new();
        assert_eq!(s.validate(), Err(SpecError::EmptyTunnelId));
    }

    #[test]
    fn test_split_ipv6() {
        let (host, port) = split_host_port("[2001:db8::1]:8443").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_protocol_mode_parsing() {
        assert_eq!("TCPMUX".parse::<ProtocolMode>().unwrap(), ProtocolMode::Tcpmux);
        assert_eq!(ProtocolMode::Udp.transport(), Transport::Udp);
        assert_eq!(ProtocolMode::Grpc.transport(), Transport::Tcp);
        assert_eq!(ProtocolMode::Ws.forward_scheme(), "tcp");
        assert!("quic".parse::<ProtocolMode>().is_err());
    }

    #[test]
    fn test_health_snapshot_counts() {
        let s = spec("1.2.3.4:80");
        let mut failed = TunnelState::pending(&s);
        failed.status = TunnelStatus::Failed;
        let active = TunnelState::active(
            &s,
            TunnelHandle {
                pid: 10,
                local_port: 9000,
            },
        );

        let snapshot = HealthSnapshot::from_states(&[failed, active], 5, 3);
        assert_eq!(snapshot.tunnels_total, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.generation, 3);
    }
}
