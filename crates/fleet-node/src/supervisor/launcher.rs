//! Forwarder command lines

use super::SupervisorError;
use fleet_proto::TunnelSpec;
use std::path::{Path, PathBuf};

/// Fully resolved forwarder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Substring of the process command line that identifies this tunnel,
    /// checked before adopting a journaled pid
    pub fingerprint: String,
}

impl LaunchCommand {
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Builds the command that runs the forwarder of a tunnel
pub trait Launcher: Send + Sync {
    fn command(&self, spec: &TunnelSpec) -> Result<LaunchCommand, SupervisorError>;
}

const DEFAULT_GOST_PATH: &str = "/usr/local/bin/gost";

/// `gost -L=<mode>://0.0.0.0:<port> -F=<tcp|udp>://<target>`
#[derive(Debug, Clone, Default)]
pub struct GostLauncher {
    binary: Option<PathBuf>,
}

impl GostLauncher {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    fn locate(&self) -> Result<PathBuf, SupervisorError> {
        let configured = self
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_GOST_PATH));
        if is_executable(&configured) {
            return Ok(configured);
        }

        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join("gost"))
                    .find(|candidate| is_executable(candidate))
            })
            .ok_or_else(|| {
                SupervisorError::LaunchFailed(format!(
                    "gost binary not found at {} or in PATH",
                    configured.display()
                ))
            })
    }
}

impl Launcher for GostLauncher {
    fn command(&self, spec: &TunnelSpec) -> Result<LaunchCommand, SupervisorError> {
        let program = self.locate()?;
        let listen = format!("-L={}://0.0.0.0:{}", spec.mode.as_str(), spec.local_port);
        let forward = format!("-F={}://{}", spec.mode.forward_scheme(), spec.remote_target);

        Ok(LaunchCommand {
            program,
            fingerprint: listen.clone(),
            args: vec![listen, forward],
        })
    }
}

/// Runs a shell command template through `sh -c`.
///
/// Placeholders: `{tunnel_id}`, `{local_port}`, `{remote_target}`, `{mode}`.
/// The shell is named `fleet-tunnel-<tunnel_id>` so the journal can find it
/// again after a restart.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    template: String,
}

impl CommandLauncher {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl Launcher for CommandLauncher {
    fn command(&self, spec: &TunnelSpec) -> Result<LaunchCommand, SupervisorError> {
        let rendered = self
            .template
            .replace("{tunnel_id}", &spec.tunnel_id)
            .replace("{local_port}", &spec.local_port.to_string())
            .replace("{remote_target}", &spec.remote_target)
            .replace("{mode}", spec.mode.as_str());
        let name = format!("fleet-tunnel-{}", spec.tunnel_id);

        // Trailing exit keeps sh as the group leader instead of exec'ing
        Ok(LaunchCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                format!("{}; exit $?", rendered),
                name.clone(),
            ],
            fingerprint: name,
        })
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_proto::ProtocolMode;

    fn spec(mode: ProtocolMode) -> TunnelSpec {
        TunnelSpec {
            tunnel_id: "web".to_string(),
            node_id: "node-a".to_string(),
            local_port: 8443,
            remote_target: "10.0.0.5:443".to_string(),
            mode,
            enabled: true,
            version: 1,
        }
    }

    fn fake_gost() -> (tempfile::TempDir, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gost");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    #[test]
    fn test_gost_arguments_per_mode() {
        let (_dir, path) = fake_gost();
        let launcher = GostLauncher::new(Some(path.clone()));

        let tcp = launcher.command(&spec(ProtocolMode::Tcp)).unwrap();
        assert_eq!(tcp.program, path);
        assert_eq!(
            tcp.args,
            vec!["-L=tcp://0.0.0.0:8443", "-F=tcp://10.0.0.5:443"]
        );

        let udp = launcher.command(&spec(ProtocolMode::Udp)).unwrap();
        assert_eq!(
            udp.args,
            vec!["-L=udp://0.0.0.0:8443", "-F=udp://10.0.0.5:443"]
        );

        let grpc = launcher.command(&spec(ProtocolMode::Grpc)).unwrap();
        assert_eq!(
            grpc.args,
            vec!["-L=grpc://0.0.0.0:8443", "-F=tcp://10.0.0.5:443"]
        );
        assert_eq!(grpc.fingerprint, "-L=grpc://0.0.0.0:8443");
    }

    #[test]
    fn test_command_template_rendering() {
        let launcher = CommandLauncher::new("socat TCP-LISTEN:{local_port},fork TCP:{remote_target}");
        let command = launcher.command(&spec(ProtocolMode::Tcp)).unwrap();

        assert_eq!(command.program, PathBuf::from("/bin/sh"));
        assert_eq!(
            command.args[1],
            "socat TCP-LISTEN:8443,fork TCP:10.0.0.5:443; exit $?"
        );
        assert_eq!(command.args[2], "fleet-tunnel-web");
        assert_eq!(command.fingerprint, "fleet-tunnel-web");
    }
}
