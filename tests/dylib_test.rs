//! A real shared-library plugin hosted by the `sandbox` subcommand.

mod common;

use common::{context, process_alive, write_plugin, COOPERATIVE};
use futures::FutureExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use plugin_loader::error::{LoaderError, PluginError};
use plugin_loader::plugin::{
    EventCallback, PluginManifest, PluginWrapper, SandboxLauncher, SupervisorContext,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;

const GRACE: Duration = Duration::from_secs(5);

fn build_cdylib(source: &Path, output: &Path) {
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let status = Command::new(rustc)
        .args(["--crate-type", "cdylib", "--edition", "2021", "-o"])
        .arg(output)
        .arg(source)
        .status()
        .expect("failed to run rustc");
    assert!(status.success(), "failed to compile {}", source.display());
}

/// Installs the echo plugin under `plugins/echo`, with one extra library in
/// its modules directory.
fn install_echo_plugin(root: &Path) -> PathBuf {
    let entry = write_plugin(root, "echo", "Echo", &[], true);
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/echo_plugin.rs");
    build_cdylib(&fixture, &entry);

    let modules = root.join("plugins/echo/lib");
    std::fs::create_dir_all(&modules).unwrap();
    let dep_source = root.join("echo_dep.rs");
    std::fs::write(
        &dep_source,
        "#[no_mangle]\npub extern \"C\" fn echo_dep_version() -> i32 { 1 }\n",
    )
    .unwrap();
    let dep = modules.join(format!("libecho_dep{}", std::env::consts::DLL_SUFFIX));
    build_cdylib(&dep_source, &dep);

    entry
}

fn sandbox_context(root: &Path) -> SupervisorContext {
    let mut ctx = context(root, COOPERATIVE);
    ctx.launcher = SandboxLauncher::new(env!("CARGO_BIN_EXE_plugin-loader"), vec![]);
    ctx.sandbox.connect_retries = 250;
    ctx.sandbox.stop_grace_ms = GRACE.as_millis() as u64;
    ctx
}

fn start_echo(root: &Path) -> (PluginWrapper, mpsc::UnboundedReceiver<(String, Value)>) {
    let ctx = sandbox_context(root);
    let entry = install_echo_plugin(root);
    let manifest = PluginManifest::load(&ctx.plugin_path, "echo").unwrap();

    let (event_tx, events) = mpsc::unbounded_channel();
    let on_event: EventCallback = Arc::new(move |event, args| {
        let _ = event_tx.send((event, args));
        async {}.boxed()
    });
    let wrapper = PluginWrapper::new(manifest, &entry, "echo", &ctx, on_event).unwrap();
    (wrapper, events)
}

fn runtime_dir(root: &Path) -> PathBuf {
    root.join("homebrew/data/echo")
}

#[tokio::test]
async fn test_shared_library_plugin_round_trip() {
    let root = TempDir::new().unwrap();
    let (plugin, mut events) = start_echo(root.path());
    plugin.start().await.unwrap();
    let pid = plugin.pid().await.unwrap();

    let result = plugin
        .execute_method("echo", vec![json!({"x": 1}), json!("y")])
        .await
        .unwrap();
    assert_eq!(result, json!([{"x": 1}, "y"]));

    let (event, args) = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event forwarded")
        .unwrap();
    assert_eq!(event, "echoed");
    assert_eq!(args, json!([{"x": 1}, "y"]));

    let err = plugin.execute_method("fail", vec![]).await.unwrap_err();
    assert!(matches!(err, LoaderError::Plugin(PluginError::MethodFailed(ref m)) if m == "nope"));

    // The main hook never returns; stopping must not wait out the grace period
    let started = Instant::now();
    plugin.stop(true).await;
    assert!(started.elapsed() < GRACE / 2, "sandbox needed {:?}", started.elapsed());
    assert!(!process_alive(pid));

    assert!(runtime_dir(root.path()).join("unloaded").is_file());
    assert!(runtime_dir(root.path()).join("uninstalled").is_file());
}

#[tokio::test]
async fn test_sandbox_exits_on_sigterm_while_main_runs() {
    let root = TempDir::new().unwrap();
    let (plugin, _events) = start_echo(root.path());
    plugin.start().await.unwrap();
    let pid = plugin.pid().await.unwrap();

    // Once a call is answered the main hook is already running
    plugin.execute_method("echo", vec![]).await.unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // An exited process is only reaped here; a live one would need the full grace period
    let started = Instant::now();
    plugin.stop(false).await;
    assert!(started.elapsed() < GRACE / 2, "sandbox needed {:?}", started.elapsed());

    assert!(runtime_dir(root.path()).join("unloaded").is_file());
    assert!(!runtime_dir(root.path()).join("uninstalled").exists());
}
