//! One authenticated node's control session on the panel
//!
//! The session pushes the node's full desired tunnel set whenever the
//! registry bumps its generation, and files heartbeats and status reports
//! coming back. It ends when the node disconnects, goes silent for longer
//! than the unreachable threshold, is removed by an operator, or the panel
//! shuts down.

use crate::registry::{FleetRegistry, RegistryError};
use fleet_channel::{ChannelError, ControlReceiver, ControlSender};
use fleet_proto::ControlMessage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("No traffic from node for {0:?}")]
    Idle(Duration),
}

enum Flow {
    Continue,
    Stop,
}

pub struct NodeSession {
    node_id: String,
    session: u64,
    registry: Arc<FleetRegistry>,
    sender: ControlSender,
    receiver: ControlReceiver,
    idle_timeout: Duration,
}

impl NodeSession {
    pub fn new(
        node_id: String,
        session: u64,
        registry: Arc<FleetRegistry>,
        sender: ControlSender,
        receiver: ControlReceiver,
    ) -> Self {
        let config = registry.config();
        let idle_timeout = config.heartbeat_interval * config.missed_heartbeats.max(1);
        Self {
            node_id,
            session,
            registry,
            sender,
            receiver,
            idle_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Drive the session to completion and record the disconnect
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        let result = self.serve(shutdown).await;

        let reason = match &result {
            Ok(()) => None,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "Node session ended with error");
                Some(e.to_string())
            }
        };
        self.registry
            .mark_disconnected(&self.node_id, self.session, reason)
            .await;
    }

    async fn serve(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut generations = self.registry.subscribe(&self.node_id).await?;
        generations.borrow_and_update();
        self.push_config().await?;

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.disconnect("panel shutting down").await;
                    return Ok(());
                }
                changed = generations.changed() => {
                    if changed.is_err() {
                        info!(node_id = %self.node_id, "Node removed, closing session");
                        self.disconnect("node removed by operator").await;
                        return Ok(());
                    }
                    self.push_config().await?;
                }
                msg = self.receiver.recv() => {
                    let Some(msg) = msg? else {
                        debug!(node_id = %self.node_id, "Node closed the control connection");
                        return Ok(());
                    };
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    if let Flow::Stop = self.handle(msg).await? {
                        return Ok(());
                    }
                }
                _ = &mut idle => {
                    return Err(SessionError::Idle(self.idle_timeout));
                }
            }
        }
    }

    async fn handle(&mut self, msg: ControlMessage) -> Result<Flow, SessionError> {
        match msg {
            ControlMessage::Heartbeat { node_id, health } => {
                if self.claims_other_node(&node_id) {
                    return Ok(Flow::Continue);
                }
                self.registry.record_heartbeat(&self.node_id, health).await?;
            }
            ControlMessage::ReportStatus {
                node_id,
                generation,
                tunnels,
            } => {
                if self.claims_other_node(&node_id) {
                    return Ok(Flow::Continue);
                }
                debug!(
                    node_id = %self.node_id,
                    generation,
                    tunnels = tunnels.len(),
                    "Status report"
                );
                self.registry
                    .record_status(&self.node_id, generation, tunnels)
                    .await?;
            }
            ControlMessage::Disconnect { reason } => {
                info!(node_id = %self.node_id, reason = %reason, "Node disconnecting");
                return Ok(Flow::Stop);
            }
            other => {
                warn!(
                    node_id = %self.node_id,
                    kind = other.kind(),
                    "Unexpected message from node"
                );
            }
        }
        Ok(Flow::Continue)
    }

    fn claims_other_node(&self, claimed: &str) -> bool {
        if claimed == self.node_id {
            return false;
        }
        warn!(
            node_id = %self.node_id,
            claimed = %claimed,
            "Ignoring message for another node id"
        );
        true
    }

    async fn push_config(&self) -> Result<(), SessionError> {
        let (generation, tunnels) = self.registry.desired(&self.node_id).await?;
        debug!(
            node_id = %self.node_id,
            generation,
            tunnels = tunnels.len(),
            "Pushing config"
        );
        self.sender
            .send(ControlMessage::PushConfig {
                node_id: self.node_id.clone(),
                generation,
                tunnels,
            })
            .await?;
        Ok(())
    }

    async fn disconnect(&self, reason: &str) {
        let _ = self
            .sender
            .send(ControlMessage::Disconnect {
                reason: reason.to_string(),
            })
            .await;
        let _ = self.sender.close().await;
    }
}
