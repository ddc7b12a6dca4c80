//! Wires a node together from its config file and runs it until shutdown

use crate::agent::{AgentError, NodeAgent};
use crate::config::NodeConfigFile;
use crate::desired::DesiredStore;
use crate::reconcile::Reconciler;
use crate::status::{self, StatusState};
use crate::supervisor::Supervisor;
use fleet_trust::TrustStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run a node. Returns after `shutdown` flips and cleanup is done.
pub async fn run_node(
    config: NodeConfigFile,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    fleet_trust::ensure_crypto_provider();

    // A node without valid trust material never starts
    let trust = Arc::new(TrustStore::load(&config.trust_paths()).map_err(AgentError::Trust)?);
    info!(
        node_id = %trust.identity().common_name,
        not_after = %trust.identity().not_after,
        "Loaded node identity"
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let desired = Arc::new(DesiredStore::open(&config.data_dir)?);
    let supervisor = Arc::new(Supervisor::new(
        config.supervisor_config(),
        config.host_network(),
        config.launcher(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        config.reconciler_config(),
        supervisor.clone(),
        desired,
    ));
    reconciler.recover().await?;

    let agent = NodeAgent::new(config.agent_config(), trust, reconciler.clone())?;

    let status_state = StatusState {
        node_id: agent.node_id().to_string(),
        channel: agent.channel_state(),
        reconciler: reconciler.clone(),
        started: Instant::now(),
    };
    let status_task = {
        let mut shutdown = shutdown.clone();
        let addr = config.api_listen;
        tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = status::serve(addr, status_state, signal).await {
                error!(addr = %addr, error = %e, "Node status API failed");
            }
        })
    };

    let reconcile_task = tokio::spawn(reconciler.clone().run(shutdown.clone()));

    if let Err(e) = agent.run(shutdown.clone()).await {
        // Tunnels keep following the last accepted config; only redialing stops
        warn!(error = %e, "Control channel disabled until the node is restarted");
        let mut shutdown = shutdown.clone();
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    reconciler.begin_shutdown();
    if let Err(e) = reconcile_task.await {
        error!(error = %e, "Reconciler task failed");
    }

    if config.keep_tunnels_on_shutdown {
        info!("Leaving tunnels running");
    } else {
        supervisor.cleanup_all().await;
    }

    if let Err(e) = status_task.await {
        error!(error = %e, "Status API task failed");
    }
    info!("Node stopped");
    Ok(())
}
