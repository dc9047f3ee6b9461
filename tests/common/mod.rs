#![allow(dead_code)]

use plugin_loader::config::SandboxConfig;
use plugin_loader::plugin::manifest::{entry_point_name, MANIFEST_FILE};
use plugin_loader::plugin::{SandboxLauncher, SupervisorContext};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Stands in for a sandbox that exits on SIGTERM.
pub const COOPERATIVE: &str = "exec sleep 30";
/// Stands in for a sandbox that ignores SIGTERM.
pub const STUBBORN: &str = "trap '' TERM; while true; do sleep 0.05; done";

pub fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| "root".to_string())
}

pub fn context(root: &Path, script: &str) -> SupervisorContext {
    let socket_dir = root.join("sockets");
    std::fs::create_dir_all(&socket_dir).unwrap();
    std::fs::create_dir_all(root.join("plugins")).unwrap();

    SupervisorContext {
        plugin_path: root.join("plugins"),
        homebrew_path: root.join("homebrew"),
        host_user: current_user(),
        loader_version: "test".to_string(),
        sandbox: SandboxConfig {
            socket_dir,
            connect_retries: 100,
            connect_backoff_ms: 20,
            stop_grace_ms: 300,
            control_frame_timeout_ms: 200,
            ..SandboxConfig::default()
        },
        launcher: SandboxLauncher::new("sh", vec!["-c".to_string(), script.to_string()]),
    }
}

/// Writes `plugins/<dir>/plugin.json`; with `backend` an entry point file is
/// created too, so the plugin is not passive.
pub fn write_plugin(root: &Path, dir: &str, name: &str, flags: &[&str], backend: bool) -> PathBuf {
    let plugin_dir = root.join("plugins").join(dir);
    std::fs::create_dir_all(&plugin_dir).unwrap();

    let manifest = serde_json::json!({
        "name": name,
        "author": "tests",
        "flags": flags,
        "api_version": 1,
    });
    std::fs::write(plugin_dir.join(MANIFEST_FILE), manifest.to_string()).unwrap();
    std::fs::write(
        plugin_dir.join("package.json"),
        r#"{"version":"1.0.0","type":"module"}"#,
    )
    .unwrap();

    let entry = plugin_dir.join(entry_point_name());
    if backend {
        std::fs::write(&entry, b"").unwrap();
    }
    entry
}

pub fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
