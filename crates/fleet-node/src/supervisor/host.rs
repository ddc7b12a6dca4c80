//! Host networking checks run before a forwarder is launched

use super::SupervisorError;
use async_trait::async_trait;
use fleet_proto::Transport;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::path::PathBuf;
use tracing::{debug, info};

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Host operations the supervisor depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Resolve the remote target; an empty answer is an error
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SupervisorError>;

    /// Make sure the kernel forwards IPv4 packets
    fn ensure_ip_forward(&self) -> Result<(), SupervisorError>;

    /// Check that `port` can be bound on all interfaces
    fn probe_port(&self, transport: Transport, port: u16) -> Result<(), SupervisorError>;
}

/// The real host
pub struct SystemNetwork {
    ip_forward_path: Option<PathBuf>,
}

impl SystemNetwork {
    pub fn new() -> Self {
        Self {
            ip_forward_path: Some(PathBuf::from(IP_FORWARD_PATH)),
        }
    }

    /// Leave the kernel forwarding switch alone (unprivileged runs, tests)
    pub fn without_ip_forward() -> Self {
        Self {
            ip_forward_path: None,
        }
    }
}

impl Default for SystemNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostNetwork for SystemNetwork {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SupervisorError> {
        let target = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SupervisorError::InvalidEndpoint(format!("{}: {}", target, e)))?
            .collect();

        if addrs.is_empty() {
            return Err(SupervisorError::InvalidEndpoint(format!(
                "{}: no addresses",
                target
            )));
        }
        debug!(target = %target, resolved = addrs.len(), "Resolved remote target");
        Ok(addrs)
    }

    fn ensure_ip_forward(&self) -> Result<(), SupervisorError> {
        let Some(path) = &self.ip_forward_path else {
            return Ok(());
        };

        let current = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::PermissionDenied(format!("read {}: {}", path.display(), e))
        })?;
        if current.trim() == "1" {
            return Ok(());
        }

        std::fs::write(path, "1\n").map_err(|e| {
            SupervisorError::PermissionDenied(format!(
                "enable IPv4 forwarding via {}: {}",
                path.display(),
                e
            ))
        })?;
        info!("Enabled IPv4 forwarding");
        Ok(())
    }

    fn probe_port(&self, transport: Transport, port: u16) -> Result<(), SupervisorError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let result = match transport {
            Transport::Tcp => TcpListener::bind(addr).map(drop),
            Transport::Udp => UdpSocket::bind(addr).map(drop),
        };

        result.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => SupervisorError::PortInUse(port),
            io::ErrorKind::PermissionDenied => {
                SupervisorError::PermissionDenied(format!("bind port {}: {}", port, e))
            }
            _ => SupervisorError::LaunchFailed(format!("probe port {}: {}", port, e)),
        })
    }
}
