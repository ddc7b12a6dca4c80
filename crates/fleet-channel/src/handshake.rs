//! Session establishment on both ends of the control channel

use crate::connection::ControlConnection;
use crate::error::{from_tls_io, ChannelError};
use fleet_proto::{ControlMessage, NodeAnnounce};
use fleet_trust::{
    claimed_common_name, Identity, RejectionHook, TrustError, TrustRejection, TrustStore,
};
use rustls::pki_types::{CertificateDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};

const NONCE_LEN: usize = 32;

/// Handshake tuning
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Whole handshake (TCP connect, TLS, challenge) must finish within this
    pub handshake_timeout: Duration,
    /// Heartbeat interval the panel hands to nodes
    pub heartbeat_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// A node that completed the handshake with us (panel side)
pub struct AcceptedNode {
    pub node_id: String,
    pub identity: Identity,
    pub announce: NodeAnnounce,
    pub connection: ControlConnection,
}

/// The panel we completed the handshake with (node side)
pub struct ConnectedPanel {
    pub panel: Identity,
    pub heartbeat_interval: Duration,
    pub connection: ControlConnection,
}

fn peer_certificate(certs: Option<&[CertificateDer<'static>]>) -> Result<CertificateDer<'static>, TrustError> {
    certs
        .and_then(|certs| certs.first())
        .cloned()
        .ok_or_else(|| TrustError::UntrustedPeer("peer presented no certificate".to_string()))
}

/// Panel-side acceptor
pub struct ControlAcceptor {
    tls: TlsAcceptor,
    trust: Arc<TrustStore>,
    on_reject: Option<RejectionHook>,
    config: HandshakeConfig,
}

impl ControlAcceptor {
    pub fn new(
        trust: Arc<TrustStore>,
        on_reject: Option<RejectionHook>,
        config: HandshakeConfig,
    ) -> Result<Self, ChannelError> {
        let server_config = trust.server_config(on_reject.clone())?;
        Ok(Self {
            tls: TlsAcceptor::from(server_config),
            trust,
            on_reject,
            config,
        })
    }

    /// Hand a trust failure after TLS to the same hook TLS rejections use
    fn report(&self, common_name: Option<String>, error: &TrustError) {
        if let Some(hook) = &self.on_reject {
            hook(TrustRejection {
                common_name,
                error: error.clone(),
            });
        }
    }

    /// Run the full handshake on an accepted TCP stream
    pub async fn accept(
        &self,
        tcp: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<AcceptedNode, ChannelError> {
        timeout(self.config.handshake_timeout, self.accept_inner(tcp, peer_addr))
            .await
            .map_err(|_| ChannelError::Timeout("handshake"))?
    }

    async fn accept_inner(
        &self,
        tcp: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<AcceptedNode, ChannelError> {
        let tls = self.tls.accept(tcp).await.map_err(from_tls_io)?;
        let peer_cert = peer_certificate(tls.get_ref().1.peer_certificates())?;
        let identity = match self.trust.verify_peer(&peer_cert) {
            Ok(identity) => identity,
            Err(e) => {
                self.report(claimed_common_name(&peer_cert), &e);
                return Err(e.into());
            }
        };

        let mut connection = ControlConnection::new(TlsStream::Server(tls), peer_addr);

        let nonce: [u8; NONCE_LEN] = rand::random();
        connection
            .send(ControlMessage::Challenge {
                nonce: nonce.to_vec(),
            })
            .await?;

        let (node_id, announce, signature) = match connection.recv().await? {
            Some(ControlMessage::Hello {
                node_id,
                announce,
                signature,
            }) => (node_id, announce, signature),
            Some(other) => {
                return Err(ChannelError::Protocol(format!(
                    "expected hello, got {}",
                    other.kind()
                )))
            }
            None => return Err(ChannelError::Closed),
        };

        let verdict = if node_id != identity.common_name {
            Err(TrustError::UntrustedPeer(format!(
                "node id '{}' does not match certificate '{}'",
                node_id, identity.common_name
            )))
        } else {
            self.trust.verify_handshake(&peer_cert, &nonce, &signature)
        };

        if let Err(e) = verdict {
            warn!(peer = %peer_addr, node_id = %node_id, error = %e, "Rejecting node handshake");
            self.report(Some(identity.common_name.clone()), &e);
            // Best effort; the peer may already be gone
            let _ = connection
                .send(ControlMessage::Rejected {
                    reason: e.to_string(),
                })
                .await;
            return Err(e.into());
        }

        connection
            .send(ControlMessage::Welcome {
                node_id: node_id.clone(),
                heartbeat_interval_secs: self.config.heartbeat_interval.as_secs().max(1),
            })
            .await?;

        info!(
            node_id = %node_id,
            peer = %peer_addr,
            fingerprint = %identity.fingerprint,
            "Node authenticated"
        );

        Ok(AcceptedNode {
            node_id,
            identity,
            announce,
            connection,
        })
    }
}

/// Node-side connector
pub struct ControlConnector {
    tls: TlsConnector,
    trust: Arc<TrustStore>,
    panel_addr: String,
    server_name: ServerName<'static>,
    announce: NodeAnnounce,
    handshake_timeout: Duration,
}

impl ControlConnector {
    pub fn new(
        trust: Arc<TrustStore>,
        panel_addr: impl Into<String>,
        server_name: &str,
        announce: NodeAnnounce,
        handshake_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let client_config = trust.client_config()?;
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ChannelError::Config(format!("Invalid panel server name: {}", e)))?;

        Ok(Self {
            tls: TlsConnector::from(client_config),
            trust,
            panel_addr: panel_addr.into(),
            server_name,
            announce,
            handshake_timeout,
        })
    }

    pub fn panel_addr(&self) -> &str {
        &self.panel_addr
    }

    /// Dial the panel and complete the handshake
    pub async fn connect(&self) -> Result<ConnectedPanel, ChannelError> {
        timeout(self.handshake_timeout, self.connect_inner())
            .await
            .map_err(|_| ChannelError::Timeout("handshake"))?
    }

    async fn connect_inner(&self) -> Result<ConnectedPanel, ChannelError> {
        debug!(panel = %self.panel_addr, "Connecting to panel");
        let tcp = TcpStream::connect(&self.panel_addr).await?;
        tcp.set_nodelay(true)?;
        let peer_addr = tcp.peer_addr()?;

        let tls = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(from_tls_io)?;
        let panel_cert = peer_certificate(tls.get_ref().1.peer_certificates())?;
        let panel = self.trust.verify_peer(&panel_cert)?;

        let mut connection = ControlConnection::new(TlsStream::Client(tls), peer_addr);

        // With TLS 1.3 a refused client certificate only surfaces on the first read
        let nonce = match connection.recv().await? {
            Some(ControlMessage::Challenge { nonce }) => nonce,
            Some(other) => {
                return Err(ChannelError::Protocol(format!(
                    "expected challenge, got {}",
                    other.kind()
                )))
            }
            None => return Err(ChannelError::Closed),
        };

        let signature = self.trust.sign_handshake(&nonce)?;
        connection
            .send(ControlMessage::Hello {
                node_id: self.trust.identity().common_name.clone(),
                announce: self.announce.clone(),
                signature,
            })
            .await?;

        match connection.recv().await? {
            Some(ControlMessage::Welcome {
                heartbeat_interval_secs,
                ..
            }) => {
                info!(panel = %self.panel_addr, identity = %panel.common_name, "Connected to panel");
                Ok(ConnectedPanel {
                    panel,
                    heartbeat_interval: Duration::from_secs(heartbeat_interval_secs.max(1)),
                    connection,
                })
            }
            Some(ControlMessage::Rejected { reason }) => Err(ChannelError::Trust(
                TrustError::UntrustedPeer(format!("panel rejected handshake: {}", reason)),
            )),
            Some(other) => Err(ChannelError::Protocol(format!(
                "expected welcome, got {}",
                other.kind()
            ))),
            None => Err(ChannelError::Closed),
        }
    }
}
