//! Panel control server: accepts node connections and runs their sessions

use crate::registry::FleetRegistry;
use crate::session::NodeSession;
use crate::tracker::SessionTracker;
use fleet_channel::{ChannelError, ControlAcceptor, HandshakeConfig};
use fleet_trust::{RejectionHook, TrustRejection, TrustStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Control server configuration
#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    pub bind_addr: SocketAddr,
    pub handshake: HandshakeConfig,
}

pub struct ControlServer {
    listener: TcpListener,
    acceptor: Arc<ControlAcceptor>,
    registry: Arc<FleetRegistry>,
    tracker: Arc<SessionTracker>,
}

impl ControlServer {
    /// Bind the listener and record trust failures, during TLS or the
    /// challenge, against the node named by the certificate
    pub async fn bind(
        config: ControlServerConfig,
        trust: Arc<TrustStore>,
        registry: Arc<FleetRegistry>,
    ) -> Result<Self, ChannelError> {
        let (rejections_tx, rejections_rx) = mpsc::unbounded_channel::<TrustRejection>();
        let on_reject: RejectionHook = Arc::new(move |rejection: TrustRejection| {
            let _ = rejections_tx.send(rejection);
        });

        let acceptor = ControlAcceptor::new(trust, Some(on_reject), config.handshake)?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Control server listening on {}", listener.local_addr()?);

        tokio::spawn(record_rejections(rejections_rx, registry.clone()));

        Ok(Self {
            listener,
            acceptor: Arc::new(acceptor),
            registry,
            tracker: Arc::new(SessionTracker::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept nodes until `shutdown` flips, then drain open sessions
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ChannelError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((tcp, peer_addr)) => {
                            debug!("New control connection from {}", peer_addr);
                            tokio::spawn(handle_connection(
                                tcp,
                                peer_addr,
                                self.acceptor.clone(),
                                self.registry.clone(),
                                self.tracker.clone(),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept control connection: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Control server shutting down");
                    break;
                }
            }
        }

        for handle in self.tracker.drain() {
            if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Node session did not close in time");
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Arc<ControlAcceptor>,
    registry: Arc<FleetRegistry>,
    tracker: Arc<SessionTracker>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let node = match acceptor.accept(tcp, peer_addr).await {
        Ok(node) => node,
        Err(ChannelError::Trust(e)) => {
            warn!(peer = %peer_addr, error = %e, "Node failed trust verification");
            return;
        }
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "Control handshake failed");
            return;
        }
    };

    let (_, session) = match registry
        .register_session(&node.node_id, &node.identity, &node.announce)
        .await
    {
        Ok(registered) => registered,
        Err(e) => {
            warn!(node_id = %node.node_id, error = %e, "Refusing node registration");
            return;
        }
    };

    let node_id = node.node_id.clone();
    let (sender, receiver) = node.connection.split();
    let session_task = NodeSession::new(node_id.clone(), session, registry, sender, receiver);

    let session_tracker = tracker.clone();
    let finished_node = node_id.clone();
    let handle = tokio::spawn(async move {
        session_task.run(shutdown).await;
        session_tracker.finish(&finished_node, session);
    });
    tracker.register(node_id, session, handle);
}

async fn record_rejections(
    mut rejections: mpsc::UnboundedReceiver<TrustRejection>,
    registry: Arc<FleetRegistry>,
) {
    while let Some(rejection) = rejections.recv().await {
        registry
            .record_trust_failure(
                rejection.common_name.as_deref(),
                &rejection.error.to_string(),
            )
            .await;
    }
}
