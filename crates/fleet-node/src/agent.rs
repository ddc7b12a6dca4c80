//! Node agent: keeps the control channel to the panel up and bridges it to
//! the reconciler

use crate::desired::DesiredError;
use crate::reconcile::{Reconciler, StatusReport};
use crate::supervisor::SupervisorError;
use fleet_channel::{
    ChannelError, ControlConnector, ControlReceiver, ControlSender, ReconnectConfig,
    ReconnectManager,
};
use fleet_proto::{ControlMessage, HealthSnapshot, NodeAnnounce};
use fleet_trust::{TrustError, TrustStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("trust failure, not reconnecting: {0}")]
    Trust(TrustError),

    #[error("control channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("desired state error: {0}")]
    Desired(#[from] DesiredError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    fn from_channel(err: ChannelError) -> Self {
        match err {
            ChannelError::Trust(e) => AgentError::Trust(e),
            other => AgentError::Channel(other),
        }
    }
}

/// Control channel state as shown on the node's status API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Connected,
    Disconnected,
    TrustFailed,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Panel control address (`host:port`)
    pub panel_addr: String,
    /// Name the panel certificate must carry
    pub server_name: String,
    pub announce: NodeAnnounce,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

pub struct NodeAgent {
    config: AgentConfig,
    node_id: String,
    connector: ControlConnector,
    reconciler: Arc<Reconciler>,
    state_tx: watch::Sender<ChannelState>,
    started: Instant,
}

impl NodeAgent {
    pub fn new(
        config: AgentConfig,
        trust: Arc<TrustStore>,
        reconciler: Arc<Reconciler>,
    ) -> Result<Self, AgentError> {
        let node_id = trust.identity().common_name.clone();
        let connector = ControlConnector::new(
            trust,
            config.panel_addr.clone(),
            &config.server_name,
            config.announce.clone(),
            config.handshake_timeout,
        )
        .map_err(AgentError::from_channel)?;
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);

        Ok(Self {
            config,
            node_id,
            connector,
            reconciler,
            state_tx,
            started: Instant::now(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn channel_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Connect, serve the session, reconnect with backoff. Returns `Ok` on
    /// shutdown and an error only for trust failures, which retrying with the
    /// same certificates cannot fix.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state_tx.send_replace(ChannelState::Connecting);
            let connected = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(panel) => {
                    reconnect.reset();
                    self.state_tx.send_replace(ChannelState::Connected);

                    let (sender, receiver) = panel.connection.split();
                    let end = self
                        .session(&sender, receiver, panel.heartbeat_interval, &mut shutdown)
                        .await;
                    let _ = sender.close().await;

                    match end {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Lost(reason)) => {
                            warn!(panel = %self.config.panel_addr, reason = %reason, "Control session lost");
                        }
                        Err(e) if e.is_trust() => {
                            return Err(self.trust_failed(e));
                        }
                        Err(e) => {
                            warn!(panel = %self.config.panel_addr, error = %e, "Control session failed");
                        }
                    }
                }
                Err(e) if e.is_trust() => {
                    return Err(self.trust_failed(e));
                }
                Err(e) => {
                    warn!(
                        panel = %self.config.panel_addr,
                        attempt = reconnect.attempt() + 1,
                        error = %e,
                        "Failed to connect to panel"
                    );
                }
            }

            self.state_tx.send_replace(ChannelState::Disconnected);
            let delay = reconnect.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting to panel");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.state_tx.send_replace(ChannelState::Disconnected);
        info!("Node agent stopped");
        Ok(())
    }

    fn trust_failed(&self, err: ChannelError) -> AgentError {
        error!(
            panel = %self.config.panel_addr,
            error = %err,
            "Trust failure on control channel; fix certificates and restart the node"
        );
        self.state_tx.send_replace(ChannelState::TrustFailed);
        AgentError::from_channel(err)
    }

    async fn session(
        &self,
        sender: &ControlSender,
        mut receiver: ControlReceiver,
        heartbeat_interval: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ChannelError> {
        let mut reports = self.reconciler.subscribe();
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The panel learns current state right away, not at the next change
        let initial = reports.borrow_and_update().clone();
        self.send_report(sender, initial).await?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown requested, disconnecting from panel");
                    if let Err(e) = sender
                        .send(ControlMessage::Disconnect {
                            reason: "node shutting down".to_string(),
                        })
                        .await
                    {
                        debug!(error = %e, "Failed to send disconnect");
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    let health = self.health().await;
                    sender
                        .send(ControlMessage::Heartbeat {
                            node_id: self.node_id.clone(),
                            health,
                        })
                        .await?;
                }
                changed = reports.changed() => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Lost("reconciler stopped".to_string()));
                    }
                    let report = reports.borrow_and_update().clone();
                    self.send_report(sender, report).await?;
                }
                msg = receiver.recv() => {
                    match msg? {
                        Some(ControlMessage::PushConfig { node_id, generation, tunnels }) => {
                            if let Some(held) = self.handle_push(&node_id, generation, tunnels) {
                                // The panel lost track of this node; it continues above `held`
                                let report = StatusReport {
                                    generation: held,
                                    tunnels: self.reconciler.snapshot().await,
                                };
                                self.send_report(sender, report).await?;
                            }
                        }
                        Some(ControlMessage::Disconnect { reason }) => {
                            info!(reason = %reason, "Panel closed the session");
                            return Ok(SessionEnd::Lost(reason));
                        }
                        Some(other) => {
                            warn!(kind = other.kind(), "Unexpected message from panel");
                        }
                        None => {
                            return Ok(SessionEnd::Lost("connection closed".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Returns the held generation when the push is older than it
    fn handle_push(
        &self,
        node_id: &str,
        generation: u64,
        tunnels: Vec<fleet_proto::TunnelSpec>,
    ) -> Option<u64> {
        if node_id != self.node_id {
            warn!(
                node_id = %node_id,
                expected = %self.node_id,
                "Ignoring config addressed to another node"
            );
            return None;
        }

        debug!(generation, tunnels = tunnels.len(), "Config pushed");
        match self.reconciler.desired().accept_push(generation, tunnels) {
            Ok(outcome) if outcome.changed => self.reconciler.wake(),
            Ok(_) => debug!(generation, "Config unchanged"),
            Err(DesiredError::ConfigConflict { held, .. }) => return Some(held),
            Err(e) => error!(generation, error = %e, "Failed to store pushed config"),
        }
        None
    }

    async fn send_report(
        &self,
        sender: &ControlSender,
        report: StatusReport,
    ) -> Result<(), ChannelError> {
        sender
            .send(ControlMessage::ReportStatus {
                node_id: self.node_id.clone(),
                generation: report.generation,
                tunnels: report.tunnels,
            })
            .await
    }

    async fn health(&self) -> HealthSnapshot {
        let states = self.reconciler.snapshot().await;
        HealthSnapshot::from_states(
            &states,
            self.started.elapsed().as_secs(),
            self.reconciler.desired().generation(),
        )
    }
}
