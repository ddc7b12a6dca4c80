//! Panel control server and node agent over loopback mTLS

use fleet_channel::{HandshakeConfig, ReconnectConfig};
use fleet_control::{ControlServer, ControlServerConfig, FleetRegistry, RegistryConfig};
use fleet_node::supervisor::{CommandLauncher, SystemNetwork};
use fleet_node::{
    AgentConfig, AgentError, ChannelState, DesiredStore, NodeAgent, Reconciler,
    ReconcilerConfig, Supervisor, SupervisorConfig,
};
use fleet_proto::{NodeAnnounce, ProtocolMode, TunnelSpec, TunnelStatus};
use fleet_trust::{CertificateAuthority, IssueRequest, TrustStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Panel {
    addr: String,
    registry: Arc<FleetRegistry>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn trust(ca: &CertificateAuthority, ca_pem: &str, request: IssueRequest) -> Arc<TrustStore> {
    let issued = ca.issue(&request).unwrap();
    Arc::new(TrustStore::from_pem(ca_pem, &issued.cert_pem, &issued.key_pem).unwrap())
}

async fn start_panel(panel_trust: Arc<TrustStore>) -> Panel {
    let registry = Arc::new(FleetRegistry::new(RegistryConfig {
        heartbeat_interval: Duration::from_secs(1),
        missed_heartbeats: 3,
    }));
    let server = ControlServer::bind(
        ControlServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            handshake: HandshakeConfig {
                handshake_timeout: Duration::from_secs(5),
                heartbeat_interval: Duration::from_secs(1),
            },
        },
        panel_trust,
        registry.clone(),
    )
    .await
    .unwrap();

    let addr = server.local_addr().unwrap().to_string();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        server.run(shutdown_rx).await.unwrap();
    });

    Panel {
        addr,
        registry,
        shutdown,
        task,
    }
}

fn reconciler(dir: &Path) -> Arc<Reconciler> {
    let mut config = SupervisorConfig::new(dir);
    config.startup_grace = Duration::from_millis(200);
    config.teardown_grace = Duration::from_secs(1);
    let supervisor = Supervisor::new(
        config,
        Arc::new(SystemNetwork::without_ip_forward()),
        Arc::new(CommandLauncher::new("sleep 30")),
    );
    Arc::new(Reconciler::new(
        ReconcilerConfig {
            interval: Duration::from_millis(200),
            ..ReconcilerConfig::default()
        },
        Arc::new(supervisor),
        Arc::new(DesiredStore::open(dir).unwrap()),
    ))
}

fn agent(trust: Arc<TrustStore>, panel_addr: &str, reconciler: Arc<Reconciler>) -> NodeAgent {
    NodeAgent::new(
        AgentConfig {
            panel_addr: panel_addr.to_string(),
            server_name: "localhost".to_string(),
            announce: NodeAnnounce {
                display_name: "edge-1".to_string(),
                api_address: "127.0.0.1:8081".to_string(),
                ..Default::default()
            },
            handshake_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig {
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(500),
                ..ReconnectConfig::default()
            },
        },
        trust,
        reconciler,
    )
    .unwrap()
}

fn spawn_agent(agent: NodeAgent) -> (watch::Sender<bool>, JoinHandle<Result<(), AgentError>>) {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { agent.run(shutdown_rx).await });
    (shutdown, task)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn spec(tunnel_id: &str, port: u16, enabled: bool) -> TunnelSpec {
    TunnelSpec {
        tunnel_id: tunnel_id.to_string(),
        node_id: String::new(),
        local_port: port,
        remote_target: "127.0.0.1:443".to_string(),
        mode: ProtocolMode::Tcp,
        enabled,
        version: 0,
    }
}

#[tokio::test]
async fn test_panel_edit_reaches_node_and_survives_offline_period() {
    let ca = CertificateAuthority::generate("Fleet Test CA").unwrap();
    let ca_pem = ca.cert_pem();
    let panel = start_panel(trust(
        &ca,
        &ca_pem,
        IssueRequest::new("panel").with_san("localhost"),
    ))
    .await;
    let node_trust = trust(&ca, &ca_pem, IssueRequest::new("node-e2e"));

    let dir = tempfile::tempdir().unwrap();
    let reconciler = reconciler(dir.path());
    let (reconciler_stop, reconciler_stop_rx) = watch::channel(false);
    let reconciler_task = tokio::spawn(reconciler.clone().run(reconciler_stop_rx));

    let first = agent(node_trust.clone(), &panel.addr, reconciler.clone());
    let mut channel = first.channel_state();
    let (agent_stop, agent_task) = spawn_agent(first);

    let registry = panel.registry.clone();
    eventually(|| {
        let registry = registry.clone();
        async move {
            registry
                .get_node("node-e2e")
                .await
                .is_ok_and(|node| node.connected)
        }
    })
    .await;
    channel
        .wait_for(|state| *state == ChannelState::Connected)
        .await
        .unwrap();

    // Panel sets t1 v1; node brings it up and reports it
    let port = free_port();
    let applied = registry
        .set_spec("node-e2e", spec("e2e-t1", port, true))
        .await
        .unwrap();
    eventually(|| {
        let registry = registry.clone();
        async move {
            let node = registry.get_node("node-e2e").await.unwrap();
            node.tunnels.iter().any(|state| {
                state.tunnel_id == "e2e-t1"
                    && state.status == TunnelStatus::Active
                    && state.applied_version == applied.version
            })
        }
    })
    .await;
    let active = reconciler.snapshot().await;
    assert_eq!(active.len(), 1);
    assert!(active[0].is_active());

    // Node goes offline; the panel disables t1 meanwhile
    agent_stop.send_replace(true);
    agent_task.await.unwrap().unwrap();
    eventually(|| {
        let registry = registry.clone();
        async move { !registry.get_node("node-e2e").await.unwrap().connected }
    })
    .await;

    let disabled = registry
        .set_spec("node-e2e", spec("e2e-t1", port, false))
        .await
        .unwrap();
    assert!(disabled.version > applied.version);

    // Tunnel still up while offline
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(reconciler.snapshot().await[0].is_active());

    // Reconnect: the node receives the newest version directly and tears t1 down
    let second = agent(node_trust, &panel.addr, reconciler.clone());
    let (agent_stop, agent_task) = spawn_agent(second);

    eventually(|| {
        let reconciler = reconciler.clone();
        async move { reconciler.snapshot().await.is_empty() }
    })
    .await;
    assert_eq!(reconciler.desired().generation(), disabled.version);
    eventually(|| {
        let registry = registry.clone();
        async move {
            let node = registry.get_node("node-e2e").await.unwrap();
            node.connected && node.tunnels.is_empty()
        }
    })
    .await;

    agent_stop.send_replace(true);
    agent_task.await.unwrap().unwrap();
    reconciler_stop.send_replace(true);
    reconciler_task.await.unwrap();
    reconciler.supervisor().cleanup_all().await;

    panel.shutdown.send_replace(true);
    panel.task.await.unwrap();
}

#[tokio::test]
async fn test_node_stops_redialing_a_panel_it_does_not_trust() {
    let ca = CertificateAuthority::generate("Fleet Test CA").unwrap();
    let rogue_ca = CertificateAuthority::generate("Rogue CA").unwrap();
    let rogue_pem = rogue_ca.cert_pem();
    let panel = start_panel(trust(
        &rogue_ca,
        &rogue_pem,
        IssueRequest::new("panel").with_san("localhost"),
    ))
    .await;
    let node_trust = trust(&ca, &ca.cert_pem(), IssueRequest::new("node-trust"));

    let dir = tempfile::tempdir().unwrap();
    let agent = agent(node_trust, &panel.addr, reconciler(dir.path()));
    let channel = agent.channel_state();
    let (_stop, task) = spawn_agent(agent);

    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("agent kept redialing")
        .unwrap();
    assert!(matches!(result, Err(AgentError::Trust(_))));
    assert_eq!(*channel.borrow(), ChannelState::TrustFailed);
    assert!(panel.registry.get_node("node-trust").await.is_err());

    panel.shutdown.send_replace(true);
    panel.task.await.unwrap();
}

async fn wait_until_reported_active(
    registry: &Arc<FleetRegistry>,
    node_id: &str,
    applied: &TunnelSpec,
) {
    let registry = registry.clone();
    eventually(|| {
        let registry = registry.clone();
        let node_id = node_id.to_string();
        let applied = applied.clone();
        async move {
            let Ok(node) = registry.get_node(&node_id).await else {
                return false;
            };
            node.tunnels.iter().any(|state| {
                state.tunnel_id == applied.tunnel_id
                    && state.status == TunnelStatus::Active
                    && state.applied_version == applied.version
            })
        }
    })
    .await;
}

#[tokio::test]
async fn test_removed_node_rejoins_and_applies_new_edits() {
    let ca = CertificateAuthority::generate("Fleet Test CA").unwrap();
    let ca_pem = ca.cert_pem();
    let panel = start_panel(trust(
        &ca,
        &ca_pem,
        IssueRequest::new("panel").with_san("localhost"),
    ))
    .await;
    let node_trust = trust(&ca, &ca_pem, IssueRequest::new("node-rejoin"));

    let dir = tempfile::tempdir().unwrap();
    let reconciler = reconciler(dir.path());
    let (reconciler_stop, reconciler_stop_rx) = watch::channel(false);
    let reconciler_task = tokio::spawn(reconciler.clone().run(reconciler_stop_rx));
    let (agent_stop, agent_task) = spawn_agent(agent(node_trust, &panel.addr, reconciler.clone()));

    let registry = panel.registry.clone();
    eventually(|| {
        let registry = registry.clone();
        async move {
            registry
                .get_node("node-rejoin")
                .await
                .is_ok_and(|node| node.connected)
        }
    })
    .await;

    // Two edits: the node ends up holding generation 2
    let port = free_port();
    registry
        .set_spec("node-rejoin", spec("rejoin-t1", port, true))
        .await
        .unwrap();
    let t1 = registry
        .set_spec("node-rejoin", spec("rejoin-t1", port, true))
        .await
        .unwrap();
    assert_eq!(t1.version, 2);
    wait_until_reported_active(&registry, "node-rejoin", &t1).await;
    assert_eq!(reconciler.desired().generation(), 2);

    // Removal drops the session; the agent redials and registers afresh
    registry.remove_node("node-rejoin").await.unwrap();
    eventually(|| {
        let registry = registry.clone();
        async move {
            registry
                .get_node("node-rejoin")
                .await
                .is_ok_and(|node| node.connected && node.generation > 2)
        }
    })
    .await;

    // The re-registered node starts empty, so t1 goes away
    eventually(|| {
        let reconciler = reconciler.clone();
        async move { reconciler.snapshot().await.is_empty() }
    })
    .await;

    let t2 = registry
        .set_spec("node-rejoin", spec("rejoin-t2", free_port(), true))
        .await
        .unwrap();
    assert!(t2.version > 2);
    wait_until_reported_active(&registry, "node-rejoin", &t2).await;
    assert_eq!(reconciler.desired().generation(), t2.version);
    let states = reconciler.snapshot().await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].tunnel_id, "rejoin-t2");

    agent_stop.send_replace(true);
    agent_task.await.unwrap().unwrap();
    reconciler_stop.send_replace(true);
    reconciler_task.await.unwrap();
    reconciler.supervisor().cleanup_all().await;

    panel.shutdown.send_replace(true);
    panel.task.await.unwrap();
}

#[tokio::test]
async fn test_node_ahead_of_a_fresh_panel_still_applies_edits() {
    let ca = CertificateAuthority::generate("Fleet Test CA").unwrap();
    let ca_pem = ca.cert_pem();
    let panel_trust = trust(&ca, &ca_pem, IssueRequest::new("panel").with_san("localhost"));
    let node_trust = trust(&ca, &ca_pem, IssueRequest::new("node-ahead"));

    let dir = tempfile::tempdir().unwrap();
    let reconciler = reconciler(dir.path());
    let (reconciler_stop, reconciler_stop_rx) = watch::channel(false);
    let reconciler_task = tokio::spawn(reconciler.clone().run(reconciler_stop_rx));

    let first_panel = start_panel(panel_trust.clone()).await;
    let (agent_stop, agent_task) = spawn_agent(agent(
        node_trust.clone(),
        &first_panel.addr,
        reconciler.clone(),
    ));

    let registry = first_panel.registry.clone();
    eventually(|| {
        let registry = registry.clone();
        async move {
            registry
                .get_node("node-ahead")
                .await
                .is_ok_and(|node| node.connected)
        }
    })
    .await;
    let port = free_port();
    registry
        .set_spec("node-ahead", spec("ahead-t1", port, true))
        .await
        .unwrap();
    let t1 = registry
        .set_spec("node-ahead", spec("ahead-t1", port, true))
        .await
        .unwrap();
    wait_until_reported_active(&registry, "node-ahead", &t1).await;

    agent_stop.send_replace(true);
    agent_task.await.unwrap().unwrap();
    first_panel.shutdown.send_replace(true);
    first_panel.task.await.unwrap();

    // A panel with no memory of this node starts counting from zero
    let second_panel = start_panel(panel_trust).await;
    let (agent_stop, agent_task) = spawn_agent(agent(
        node_trust,
        &second_panel.addr,
        reconciler.clone(),
    ));

    let registry = second_panel.registry.clone();
    eventually(|| {
        let registry = registry.clone();
        async move {
            registry
                .get_node("node-ahead")
                .await
                .is_ok_and(|node| node.connected && node.generation > 2)
        }
    })
    .await;
    eventually(|| {
        let reconciler = reconciler.clone();
        async move { reconciler.snapshot().await.is_empty() }
    })
    .await;

    let t2 = registry
        .set_spec("node-ahead", spec("ahead-t2", free_port(), true))
        .await
        .unwrap();
    wait_until_reported_active(&registry, "node-ahead", &t2).await;
    assert_eq!(reconciler.desired().generation(), t2.version);

    agent_stop.send_replace(true);
    agent_task.await.unwrap().unwrap();
    reconciler_stop.send_replace(true);
    reconciler_task.await.unwrap();
    reconciler.supervisor().cleanup_all().await;

    second_panel.shutdown.send_replace(true);
    second_panel.task.await.unwrap();
}
