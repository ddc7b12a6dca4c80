//! A running forwarder process and its process group

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Forwarder process owned by the supervisor.
///
/// Spawned processes are reaped through their `Child`. Adopted processes (found
/// in the journal after a restart) are not our children, so liveness falls back
/// to signal 0 plus the command line fingerprint.
pub struct TunnelProcess {
    pid: u32,
    child: Option<Child>,
    fingerprint: String,
    exit_code: Option<i32>,
    exited: bool,
}

impl TunnelProcess {
    pub fn spawned(pid: u32, child: Child, fingerprint: String) -> Self {
        Self {
            pid,
            child: Some(child),
            fingerprint,
            exit_code: None,
            exited: false,
        }
    }

    pub fn adopted(pid: u32, fingerprint: String) -> Self {
        Self {
            pid,
            child: None,
            fingerprint,
            exit_code: None,
            exited: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Exit code, once the process has exited on its own
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }

        let alive = match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    self.exit_code = status.code();
                    false
                }
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "Failed to poll forwarder");
                    false
                }
            },
            None => pid_matches(self.pid, &self.fingerprint),
        };

        if !alive {
            self.exited = true;
        }
        alive
    }

    /// SIGTERM the process group, then SIGKILL it once `grace` runs out
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        let group = Pid::from_raw(self.pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!(pid = self.pid, error = %e, "SIGTERM to process group failed");
            let _ = kill(group, Signal::SIGTERM);
        }

        if self.wait_exit(grace).await {
            debug!(pid = self.pid, "Forwarder exited after SIGTERM");
            return;
        }

        warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "Forwarder ignored SIGTERM, killing");
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            debug!(pid = self.pid, error = %e, "SIGKILL to process group failed");
            let _ = kill(group, Signal::SIGKILL);
        }
        self.wait_exit(grace).await;
        self.exited = true;
    }

    async fn wait_exit(&mut self, limit: Duration) -> bool {
        if let Some(child) = self.child.as_mut() {
            return match tokio::time::timeout(limit, child.wait()).await {
                Ok(Ok(status)) => {
                    self.exit_code = status.code();
                    self.exited = true;
                    true
                }
                Ok(Err(e)) => {
                    warn!(pid = self.pid, error = %e, "Failed to wait for forwarder");
                    false
                }
                Err(_) => false,
            };
        }

        // Zombies keep their pid but lose their command line
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if !pid_matches(self.pid, &self.fingerprint) {
                self.exited = true;
                return true;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        !pid_matches(self.pid, &self.fingerprint)
    }
}

/// Signal 0 probe; EPERM still means the pid exists
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// True when `pid` is alive and one of its arguments equals `fingerprint`
pub fn pid_matches(pid: u32, fingerprint: &str) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    let cmdline_path = format!("/proc/{}/cmdline", pid);
    match std::fs::read(Path::new(&cmdline_path)) {
        Ok(raw) => cmdline_has_arg(&raw, fingerprint),
        Err(_) => false,
    }
}

fn cmdline_has_arg(raw: &[u8], wanted: &str) -> bool {
    raw.split(|b| *b == 0)
        .any(|arg| arg == wanted.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sleeper(name: &str, script: &str) -> TunnelProcess {
        let child = Command::new("/bin/sh")
            .args(["-c", script, name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        TunnelProcess::spawned(pid, child, name.to_string())
    }

    #[test]
    fn test_cmdline_matching_is_per_argument() {
        let raw = b"/bin/sh\0-c\0sleep 30; exit $?\0fleet-tunnel-web2\0";
        assert!(cmdline_has_arg(raw, "fleet-tunnel-web2"));
        assert!(!cmdline_has_arg(raw, "fleet-tunnel-web"));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let mut process = spawn_sleeper("fleet-tunnel-term", "sleep 30; exit $?");
        assert!(process.is_alive());
        assert!(pid_matches(process.pid(), "fleet-tunnel-term"));

        process.terminate(Duration::from_secs(2)).await;
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let mut process =
            spawn_sleeper("fleet-tunnel-stubborn", "trap '' TERM; sleep 30; exit $?");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        process.terminate(Duration::from_millis(300)).await;
        assert!(!process.is_alive());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exit_code_recorded() {
        let mut process = spawn_sleeper("fleet-tunnel-exit", "exit 3");
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), Some(3));
    }

    #[test]
    fn test_dead_pid_is_not_alive() {
        assert!(!pid_alive(0));
        assert!(!pid_matches(u32::MAX / 2, "anything"));
    }
}
