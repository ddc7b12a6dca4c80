//! Reconciler against real forwarder processes (`sleep` stand-ins)

use fleet_node::supervisor::{CommandLauncher, Journal, SystemNetwork};
use fleet_node::{
    DesiredError, DesiredStore, Reconciler, ReconcilerConfig, RetryPolicy, Supervisor,
    SupervisorConfig,
};
use fleet_proto::{ProtocolMode, TunnelSpec, TunnelStatus};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn free_port() -> u16 {
    TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn spec(tunnel_id: &str, port: u16, version: u64) -> TunnelSpec {
    TunnelSpec {
        tunnel_id: tunnel_id.to_string(),
        node_id: "node-a".to_string(),
        local_port: port,
        remote_target: "127.0.0.1:80".to_string(),
        mode: ProtocolMode::Tcp,
        enabled: true,
        version,
    }
}

fn node(dir: &Path, retry: RetryPolicy, startup_grace: Duration) -> Arc<Reconciler> {
    let mut config = SupervisorConfig::new(dir);
    config.startup_grace = startup_grace;
    config.teardown_grace = Duration::from_secs(1);
    let supervisor = Supervisor::new(
        config,
        Arc::new(SystemNetwork::without_ip_forward()),
        Arc::new(CommandLauncher::new("sleep 30")),
    );
    Arc::new(Reconciler::new(
        ReconcilerConfig {
            retry,
            ..ReconcilerConfig::default()
        },
        Arc::new(supervisor),
        Arc::new(DesiredStore::open(dir).unwrap()),
    ))
}

/// Processes whose command line carries `fingerprint` as an argument
fn count_processes(fingerprint: &str) -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.chars().all(|c| c.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
        .filter(|raw| raw.split(|b| *b == 0).any(|arg| arg == fingerprint.as_bytes()))
        .count()
}

#[tokio::test]
async fn test_spec_becomes_active() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), RetryPolicy::default(), Duration::from_millis(200));
    let port = free_port();

    node.desired().accept_push(1, vec![spec("first", port, 1)]).unwrap();
    let report = node.run_pass().await;

    let state = &report.tunnels[0];
    assert_eq!(state.tunnel_id, "first");
    assert_eq!(state.status, TunnelStatus::Active);
    assert_eq!(state.applied_version, 1);
    assert_eq!(state.handle.unwrap().local_port, port);

    node.supervisor().cleanup_all().await;
}

#[tokio::test]
async fn test_repeated_passes_spawn_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), RetryPolicy::default(), Duration::from_millis(200));

    node.desired()
        .accept_push(1, vec![spec("idem", free_port(), 1)])
        .unwrap();
    let first = node.run_pass().await;
    let pid = first.tunnels[0].handle.unwrap().pid;

    for _ in 0..3 {
        let report = node.run_pass().await;
        assert_eq!(report.tunnels[0].handle.unwrap().pid, pid);
    }
    assert_eq!(count_processes("fleet-tunnel-idem"), 1);

    node.supervisor().cleanup_all().await;
    assert_eq!(count_processes("fleet-tunnel-idem"), 0);
}

#[tokio::test]
async fn test_out_of_order_pushes_converge_to_highest_version() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), RetryPolicy::default(), Duration::from_millis(200));
    let port = free_port();

    node.desired().accept_push(2, vec![spec("order", port, 2)]).unwrap();
    let late = node.desired().accept_push(1, vec![spec("order", port, 1)]);
    assert!(matches!(late, Err(DesiredError::ConfigConflict { held: 2, offered: 1 })));

    let report = node.run_pass().await;
    assert_eq!(report.generation, 2);
    assert_eq!(report.tunnels[0].applied_version, 2);

    node.supervisor().cleanup_all().await;
}

#[tokio::test]
async fn test_disabled_spec_is_stopped_then_absent() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), RetryPolicy::default(), Duration::from_millis(200));
    let port = free_port();

    node.desired().accept_push(1, vec![spec("toggled", port, 1)]).unwrap();
    node.run_pass().await;
    assert_eq!(count_processes("fleet-tunnel-toggled"), 1);

    let mut disabled = spec("toggled", port, 2);
    disabled.enabled = false;
    node.desired().accept_push(2, vec![disabled]).unwrap();

    let report = node.run_pass().await;
    assert_eq!(report.tunnels[0].status, TunnelStatus::Stopped);
    assert_eq!(count_processes("fleet-tunnel-toggled"), 0);

    let report = node.run_pass().await;
    assert!(report.tunnels.is_empty());
}

#[tokio::test]
async fn test_failing_tunnel_exhausts_budget_without_touching_others() {
    let dir = tempfile::tempdir().unwrap();
    let retry = RetryPolicy {
        budget: 5,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(1),
    };
    let node = node(dir.path(), retry, Duration::from_millis(100));

    // Something else owns the blocked tunnel's port
    let squatter = TcpListener::bind("0.0.0.0:0").unwrap();
    let taken = squatter.local_addr().unwrap().port();

    node.desired()
        .accept_push(1, vec![spec("blocked", taken, 1), spec("healthy", free_port(), 1)])
        .unwrap();

    let first = node.run_pass().await;
    let healthy_pid = first
        .tunnels
        .iter()
        .find(|s| s.tunnel_id == "healthy")
        .and_then(|s| s.handle)
        .unwrap()
        .pid;

    let mut blocked = first.tunnels[0].clone();
    for _ in 0..20 {
        if blocked.retry_exhausted {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let report = node.run_pass().await;

        let healthy = report.tunnels.iter().find(|s| s.tunnel_id == "healthy").unwrap();
        assert_eq!(healthy.status, TunnelStatus::Active);
        assert_eq!(healthy.handle.unwrap().pid, healthy_pid);

        blocked = report
            .tunnels
            .iter()
            .find(|s| s.tunnel_id == "blocked")
            .unwrap()
            .clone();
    }

    assert_eq!(blocked.status, TunnelStatus::Failed);
    assert!(blocked.retry_exhausted);
    assert_eq!(blocked.attempts, 5);
    assert!(blocked.last_error.unwrap().contains(&taken.to_string()));

    // Exhausted: further passes leave it alone
    let report = node.run_pass().await;
    let blocked = report.tunnels.iter().find(|s| s.tunnel_id == "blocked").unwrap();
    assert_eq!(blocked.attempts, 5);

    drop(squatter);
    node.supervisor().cleanup_all().await;
}

#[tokio::test]
async fn test_restart_mid_apply_adopts_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    // First node process: dies while waiting out the startup grace
    {
        let first = node(dir.path(), RetryPolicy::default(), Duration::from_secs(3));
        first
            .desired()
            .accept_push(1, vec![spec("crash", port, 1)])
            .unwrap();

        let pass = tokio::spawn({
            let first = first.clone();
            async move {
                first.run_pass().await;
            }
        });

        let journal = Journal::new(dir.path());
        for _ in 0..100 {
            if journal.load().unwrap().contains_key("crash") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(journal.load().unwrap().contains_key("crash"));

        pass.abort();
        let _ = pass.await;
    }
    assert_eq!(count_processes("fleet-tunnel-crash"), 1);

    // Second node process on the same data dir
    let second = node(dir.path(), RetryPolicy::default(), Duration::from_millis(200));
    assert_eq!(second.desired().generation(), 1);
    assert_eq!(second.recover().await.unwrap(), 1);

    let report = second.run_pass().await;
    let state = &report.tunnels[0];
    assert_eq!(state.status, TunnelStatus::Active);
    assert_eq!(state.applied_version, 1);
    assert_eq!(count_processes("fleet-tunnel-crash"), 1);

    second.supervisor().cleanup_all().await;
    assert_eq!(count_processes("fleet-tunnel-crash"), 0);
}
