//! Sandbox process spawning and termination.

use crate::config::SandboxConfig;
use crate::error::{LoaderError, PluginError, Result};
use crate::sandbox::SandboxSpec;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Builds the command that starts a plugin's sandbox.
///
/// The command is `<program> <args...> sandbox --spec <json>`; by default the
/// program is the running loader binary itself.
#[derive(Debug, Clone)]
pub struct SandboxLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl SandboxLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let program = match &config.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(LoaderError::Io)?,
        };
        Ok(Self::new(program, config.args.clone()))
    }

    pub fn spawn(&self, spec: &SandboxSpec) -> std::result::Result<Child, PluginError> {
        let spec_json = serde_json::to_string(spec).map_err(|e| PluginError::SpawnFailed {
            plugin: spec.name.clone(),
            reason: e.to_string(),
        })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("sandbox")
            .arg("--spec")
            .arg(spec_json)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| PluginError::SpawnFailed {
            plugin: spec.name.clone(),
            reason: format!("{}: {}", self.program.display(), e),
        })?;

        debug!(plugin = %spec.name, pid = ?child.id(), "Spawned sandbox");
        Ok(child)
    }
}

/// Sends SIGTERM and waits up to `grace` for the process to exit before
/// killing it.
pub async fn terminate(plugin: &str, child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(plugin = %plugin, %status, "Sandbox already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(plugin = %plugin, error = %e, "Failed to query sandbox status"),
    }

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(plugin = %plugin, pid, error = %e, "SIGTERM failed");
    }

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(plugin = %plugin, %status, "Sandbox exited");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "Failed to query sandbox status");
                break;
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    warn!(
        plugin = %plugin,
        pid,
        grace_ms = grace.as_millis() as u64,
        "Sandbox ignored SIGTERM, killing it"
    );
    if let Err(e) = child.kill().await {
        warn!(plugin = %plugin, error = %e, "Failed to kill sandbox");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::tests::sample_spec;

    fn shell(script: &str) -> SandboxLauncher {
        SandboxLauncher::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_terminate_cooperative_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut child = shell("exec sleep 30").spawn(&sample_spec(dir.path())).unwrap();

        let started = std::time::Instant::now();
        terminate("demo", &mut child, Duration::from_secs(5)).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut child = shell("trap '' TERM; while true; do sleep 0.05; done")
            .spawn(&sample_spec(dir.path()))
            .unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let grace = Duration::from_millis(300);
        let started = std::time::Instant::now();
        terminate("demo", &mut child, grace).await;

        assert!(started.elapsed() >= grace);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = SandboxLauncher::new("/nonexistent/plugin-loader", vec![]);
        let result = launcher.spawn(&sample_spec(dir.path()));
        assert!(matches!(result, Err(PluginError::SpawnFailed { .. })));
    }
}
