//! Tunnel supervisor: owns the forwarder processes running on this host
//!
//! Every tunnel is one forwarder process in its own process group. The
//! supervisor journals what it started so a restarted node can adopt live
//! forwarders instead of starting duplicates.

pub mod host;
pub mod journal;
pub mod launcher;
pub mod process;

pub use host::{HostNetwork, SystemNetwork};
pub use journal::{Journal, JournalEntry};
pub use launcher::{CommandLauncher, GostLauncher, LaunchCommand, Launcher};
pub use process::TunnelProcess;

use chrono::{DateTime, Utc};
use fleet_proto::{SpecError, TunnelHandle, TunnelSpec, TunnelState, TunnelStatus};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const LOG_TAIL_BYTES: usize = 500;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote target unreachable: {0}")]
    InvalidEndpoint(String),

    #[error("invalid tunnel spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("failed to launch forwarder: {0}")]
    LaunchFailed(String),

    #[error("forwarder exited during startup (exit code {code:?}): {log_tail}")]
    ExitedEarly { code: Option<i32>, log_tail: String },

    #[error("journal error: {0}")]
    Journal(String),
}

impl SupervisorError {
    /// Whether a failed attempt counts against the retry budget
    pub fn consumes_budget(&self) -> bool {
        !matches!(self, SupervisorError::InvalidEndpoint(_))
    }

    /// Retrying cannot help
    pub fn is_permanent(&self) -> bool {
        matches!(self, SupervisorError::InvalidSpec(_))
    }
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Holds `tunnels.json` and `logs/`
    pub data_dir: PathBuf,
    /// How long a new forwarder must stay up before it counts as started
    pub startup_grace: Duration,
    /// SIGTERM to SIGKILL delay on teardown
    pub teardown_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            startup_grace: Duration::from_millis(1500),
            teardown_grace: Duration::from_secs(5),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

struct Running {
    spec: TunnelSpec,
    process: TunnelProcess,
    log_path: PathBuf,
    started_at: DateTime<Utc>,
}

impl Running {
    fn journal_entry(&self) -> JournalEntry {
        JournalEntry {
            spec: self.spec.clone(),
            pid: self.process.pid(),
            fingerprint: self.process.fingerprint().to_string(),
            log_path: self.log_path.clone(),
            started_at: self.started_at,
        }
    }

    fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            pid: self.process.pid(),
            local_port: self.spec.local_port,
        }
    }

    fn observe(&mut self) -> TunnelState {
        if self.process.is_alive() {
            let mut state = TunnelState::active(&self.spec, self.handle());
            state.updated_at = self.started_at;
            return state;
        }

        let mut state = TunnelState::pending(&self.spec);
        state.applied_version = self.spec.version;
        state.status = TunnelStatus::Failed;
        state.last_error = Some(match self.process.exit_code() {
            Some(code) => format!("forwarder exited with code {}", code),
            None => "forwarder exited".to_string(),
        });
        state
    }
}

/// Owner of the forwarder processes on this host.
///
/// Calls for the same tunnel must not overlap; the reconciler serializes them
/// with per-tunnel locks. Calls for different tunnels may run concurrently.
pub struct Supervisor {
    config: SupervisorConfig,
    host: Arc<dyn HostNetwork>,
    launcher: Arc<dyn Launcher>,
    journal: Journal,
    tunnels: Mutex<HashMap<String, Running>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        host: Arc<dyn HostNetwork>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let journal = Journal::new(&config.data_dir);
        Self {
            config,
            host,
            launcher,
            journal,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Bring `spec` up. Returns the current state without spawning when a live
    /// forwarder already runs this exact version.
    pub async fn apply(&self, spec: &TunnelSpec) -> Result<TunnelState, SupervisorError> {
        spec.validate()?;

        let replaced = {
            let mut tunnels = self.tunnels.lock().await;
            if let Some(running) = tunnels.get_mut(&spec.tunnel_id) {
                if running.spec == *spec && running.process.is_alive() {
                    debug!(tunnel_id = %spec.tunnel_id, version = spec.version, "Forwarder already running");
                    return Ok(TunnelState::active(spec, running.handle()));
                }
            }
            tunnels.remove(&spec.tunnel_id)
        };

        if let Some(mut old) = replaced {
            info!(
                tunnel_id = %spec.tunnel_id,
                old_version = old.spec.version,
                new_version = spec.version,
                "Replacing forwarder"
            );
            old.process.terminate(self.config.teardown_grace).await;
            self.persist().await?;
        }

        let (host, port) = spec.remote_host_port()?;
        self.host.resolve(&host, port).await?;
        self.host.ensure_ip_forward()?;
        self.host.probe_port(spec.mode.transport(), spec.local_port)?;

        let command = self.launcher.command(spec)?;
        let log_path = self
            .config
            .log_dir()
            .join(format!("tunnel-{}.log", spec.tunnel_id));
        let process = spawn_forwarder(&command, &log_path, spec)?;
        let pid = process.pid();

        info!(
            tunnel_id = %spec.tunnel_id,
            version = spec.version,
            pid,
            command = %command.display(),
            "Forwarder started"
        );

        let running = Running {
            spec: spec.clone(),
            process,
            log_path: log_path.clone(),
            started_at: Utc::now(),
        };
        self.tunnels
            .lock()
            .await
            .insert(spec.tunnel_id.clone(), running);

        if let Err(e) = self.persist().await {
            self.discard(&spec.tunnel_id).await;
            return Err(e);
        }

        tokio::time::sleep(self.config.startup_grace).await;

        let exit = {
            let mut tunnels = self.tunnels.lock().await;
            match tunnels.get_mut(&spec.tunnel_id) {
                Some(running) => {
                    if running.process.is_alive() {
                        return Ok(TunnelState::active(spec, running.handle()));
                    }
                    running.process.exit_code()
                }
                None => None,
            }
        };

        self.discard(&spec.tunnel_id).await;
        let log_tail = read_log_tail(&log_path);
        warn!(
            tunnel_id = %spec.tunnel_id,
            exit_code = ?exit,
            "Forwarder exited during startup"
        );
        Err(SupervisorError::ExitedEarly {
            code: exit,
            log_tail,
        })
    }

    /// Stop a tunnel's forwarder. Unknown tunnels are a no-op.
    pub async fn teardown(&self, tunnel_id: &str) -> Result<(), SupervisorError> {
        let Some(mut running) = self.tunnels.lock().await.remove(tunnel_id) else {
            debug!(tunnel_id = %tunnel_id, "Teardown of unknown tunnel");
            return Ok(());
        };

        running.process.terminate(self.config.teardown_grace).await;
        info!(tunnel_id = %tunnel_id, pid = running.process.pid(), "Forwarder stopped");
        self.persist().await
    }

    /// Observed state of every tunnel the supervisor holds, sorted by id
    pub async fn list(&self) -> Vec<TunnelState> {
        let mut tunnels = self.tunnels.lock().await;
        let mut states: Vec<TunnelState> = tunnels.values_mut().map(Running::observe).collect();
        states.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        states
    }

    /// Adopt journaled forwarders that survived a node restart
    pub async fn recover(&self) -> Result<Vec<TunnelState>, SupervisorError> {
        let entries = self.journal.load()?;
        let mut adopted = 0usize;

        {
            let mut tunnels = self.tunnels.lock().await;
            for (tunnel_id, entry) in entries {
                if tunnels.contains_key(&tunnel_id) {
                    continue;
                }
                if !process::pid_matches(entry.pid, &entry.fingerprint) {
                    info!(tunnel_id = %tunnel_id, pid = entry.pid, "Journaled forwarder is gone");
                    continue;
                }

                info!(
                    tunnel_id = %tunnel_id,
                    pid = entry.pid,
                    version = entry.spec.version,
                    "Adopted running forwarder"
                );
                adopted += 1;
                tunnels.insert(
                    tunnel_id,
                    Running {
                        spec: entry.spec,
                        process: TunnelProcess::adopted(entry.pid, entry.fingerprint),
                        log_path: entry.log_path,
                        started_at: entry.started_at,
                    },
                );
            }
        }

        self.persist().await?;
        debug!(adopted, journal = %self.journal.path().display(), "Recovery finished");
        Ok(self.list().await)
    }

    /// Stop every forwarder (node shutdown)
    pub async fn cleanup_all(&self) {
        let drained: Vec<(String, Running)> = self.tunnels.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        info!(count = drained.len(), "Stopping all forwarders");
        let grace = self.config.teardown_grace;
        futures::future::join_all(drained.into_iter().map(|(tunnel_id, mut running)| async move {
            running.process.terminate(grace).await;
            debug!(tunnel_id = %tunnel_id, "Forwarder stopped");
        }))
        .await;

        if let Err(e) = self.persist().await {
            error!(error = %e, "Failed to clear tunnel journal");
        }
    }

    async fn discard(&self, tunnel_id: &str) {
        let removed = self.tunnels.lock().await.remove(tunnel_id);
        if let Some(mut running) = removed {
            running.process.terminate(self.config.teardown_grace).await;
        }
        if let Err(e) = self.persist().await {
            error!(tunnel_id = %tunnel_id, error = %e, "Failed to update tunnel journal");
        }
    }

    async fn persist(&self) -> Result<(), SupervisorError> {
        let tunnels = self.tunnels.lock().await;
        let entries: BTreeMap<String, JournalEntry> = tunnels
            .iter()
            .map(|(id, running)| (id.clone(), running.journal_entry()))
            .collect();
        self.journal.save(&entries)
    }
}

fn spawn_forwarder(
    command: &LaunchCommand,
    log_path: &Path,
    spec: &TunnelSpec,
) -> Result<TunnelProcess, SupervisorError> {
    let launch_failed = |what: &str, e: std::io::Error| {
        SupervisorError::LaunchFailed(format!("{} {}: {}", what, log_path.display(), e))
    };

    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| launch_failed("create log dir for", e))?;
    }
    let mut log = std::fs::File::create(log_path).map_err(|e| launch_failed("open", e))?;
    writeln!(
        log,
        "[{}] starting {} (tunnel {} v{}: {} :{} -> {})",
        Utc::now().to_rfc3339(),
        command.display(),
        spec.tunnel_id,
        spec.version,
        spec.mode,
        spec.local_port,
        spec.remote_target
    )
    .map_err(|e| launch_failed("write", e))?;
    let stderr = log.try_clone().map_err(|e| launch_failed("open", e))?;

    let child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .spawn()
        .map_err(|e| {
            SupervisorError::LaunchFailed(format!("{}: {}", command.program.display(), e))
        })?;

    let pid = child
        .id()
        .ok_or_else(|| SupervisorError::LaunchFailed("forwarder exited before it got a pid".into()))?;
    Ok(TunnelProcess::spawned(
        pid,
        child,
        command.fingerprint.clone(),
    ))
}

fn read_log_tail(path: &Path) -> String {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) => return format!("could not read {}: {}", path.display(), e),
    };
    let start = content.len().saturating_sub(LOG_TAIL_BYTES);
    String::from_utf8_lossy(&content[start..]).trim().to_string()
}
