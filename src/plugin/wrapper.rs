use super::manifest::{PluginLoadType, PluginManifest};
use super::process::{terminate, SandboxLauncher};
use super::request::PendingCall;
use crate::config::{Config, SandboxConfig};
use crate::error::{PluginError, Result, TransportError};
use crate::sandbox::privilege::ensure_user_dir;
use crate::sandbox::{environment, SandboxSpec};
use crate::transport::{CallFrame, ControlFrame, LocalSocket, SocketFrame};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Invoked with `(event, args)` for every event a plugin emits.
pub type EventCallback = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Host-wide settings shared by every wrapper.
#[derive(Debug, Clone)]
pub struct SupervisorContext {
    pub plugin_path: PathBuf,
    pub homebrew_path: PathBuf,
    pub host_user: String,
    pub loader_version: String,
    pub sandbox: SandboxConfig,
    pub launcher: SandboxLauncher,
}

impl SupervisorContext {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            plugin_path: config.plugin_path.clone(),
            homebrew_path: config.homebrew_path.clone(),
            host_user: config.host_user(),
            loader_version: env!("CARGO_PKG_VERSION").to_string(),
            sandbox: config.sandbox.clone(),
            launcher: SandboxLauncher::from_config(&config.sandbox)?,
        })
    }
}

/// Host-side handle of one plugin and its sandbox process.
pub struct PluginWrapper {
    pub manifest: PluginManifest,
    pub file: PathBuf,
    pub plugin_directory: String,
    /// Plugins without a backend entry point have no sandbox
    pub passive: bool,
    spec: SandboxSpec,
    socket: Arc<LocalSocket>,
    launcher: SandboxLauncher,
    sandbox: SandboxConfig,
    child: Mutex<Option<Child>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<DashMap<String, PendingCall>>,
    on_event: EventCallback,
    legacy_warned: AtomicBool,
}

impl PluginWrapper {
    pub fn new(
        manifest: PluginManifest,
        file: &Path,
        plugin_directory: &str,
        context: &SupervisorContext,
        on_event: EventCallback,
    ) -> Result<Self> {
        let passive = !file.is_file();
        let socket = Arc::new(LocalSocket::for_plugin(&context.sandbox));

        for dir in [
            environment::SETTINGS_DIR,
            environment::RUNTIME_DIR,
            environment::LOG_DIR,
        ] {
            let path = context.homebrew_path.join(dir).join(plugin_directory);
            ensure_user_dir(&path, &context.host_user)?;
        }

        let spec = SandboxSpec {
            name: manifest.name.clone(),
            author: manifest.author.clone(),
            version: manifest.version.clone(),
            flags: manifest.flags.clone(),
            api_version: manifest.api_version,
            file: file.to_path_buf(),
            plugin_directory: plugin_directory.to_string(),
            plugin_path: context.plugin_path.clone(),
            socket_path: socket.path().to_path_buf(),
            homebrew_path: context.homebrew_path.clone(),
            host_user: context.host_user.clone(),
            loader_version: context.loader_version.clone(),
            passive,
        };

        Ok(Self {
            manifest,
            file: file.to_path_buf(),
            plugin_directory: plugin_directory.to_string(),
            passive,
            spec,
            socket,
            launcher: context.launcher.clone(),
            sandbox: context.sandbox.clone(),
            child: Mutex::new(None),
            listener: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            on_event,
            legacy_warned: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> Option<&str> {
        self.manifest.version.as_deref()
    }

    pub fn load_type(&self) -> PluginLoadType {
        self.manifest.load_type
    }

    pub fn socket_path(&self) -> &Path {
        self.socket.path()
    }

    /// Process id of the running sandbox, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Spawns the sandbox and starts listening for its responses.
    pub async fn start(&self) -> Result<()> {
        if self.passive {
            return Ok(());
        }

        let mut child = self.child.lock().await;
        if child.is_some() {
            debug!(plugin = %self.name(), "Sandbox already running");
            return Ok(());
        }
        *child = Some(self.launcher.spawn(&self.spec)?);
        drop(child);

        let task = tokio::spawn(response_listener(
            self.name().to_string(),
            self.socket.clone(),
            self.pending.clone(),
            self.on_event.clone(),
        ));
        *self.listener.lock().await = Some(task);

        info!(plugin = %self.name(), "Started plugin");
        Ok(())
    }

    /// Calls a method with positional arguments and waits for its result.
    pub async fn execute_method(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.send_call(|id| CallFrame::new(id, method, Value::Array(args)))
            .await
    }

    /// Calls a method of a plugin written against the keyword-argument convention.
    pub async fn execute_legacy_method(
        &self,
        method: &str,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        if !self.legacy_warned.swap(true, Ordering::SeqCst) {
            warn!(
                plugin = %self.name(),
                "Plugin is using legacy method calls; these will be removed in a future release"
            );
        }
        self.send_call(|id| CallFrame::legacy(id, method, Value::Object(kwargs)))
            .await
    }

    async fn send_call(&self, build: impl FnOnce(String) -> CallFrame) -> Result<Value> {
        if self.passive {
            return Err(PluginError::Passive(self.name().to_string()).into());
        }

        let (call, waiter) = PendingCall::new(self.name());
        let id = call.id.clone();
        let frame = SocketFrame::from(build(id.clone()));

        if !self.socket.connect().await {
            return Err(TransportError::NotConnected(self.socket.path().display().to_string()).into());
        }

        // Registered before writing so a fast response always finds its call
        self.pending.insert(id.clone(), call);
        if let Err(e) = self.socket.write_line(&frame.encode()).await {
            self.pending.remove(&id);
            return Err(e.into());
        }
        debug!(plugin = %self.name(), call_id = %id, "Sent method call");

        Ok(waiter.wait().await?)
    }

    /// Stops the sandbox, escalating to SIGKILL if it ignores SIGTERM.
    ///
    /// Calling this again after the process is gone does nothing.
    pub async fn stop(&self, uninstall: bool) {
        if self.passive {
            return;
        }

        let Some(mut child) = self.child.lock().await.take() else {
            debug!(plugin = %self.name(), "Plugin already stopped");
            return;
        };
        info!(plugin = %self.name(), uninstall, "Stopping plugin");

        let frame = SocketFrame::from(ControlFrame::stop(uninstall)).encode();
        match tokio::time::timeout(
            self.sandbox.control_frame_timeout(),
            self.socket.write_line(&frame),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(plugin = %self.name(), error = %e, "Control frame not delivered"),
            Err(_) => debug!(plugin = %self.name(), "Timed out writing control frame"),
        }

        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
            debug!(plugin = %self.name(), "Stopped response listener");
        }
        self.socket.close().await;
        self.fail_pending();

        terminate(self.name(), &mut child, self.sandbox.stop_grace()).await;
    }

    fn fail_pending(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                call.abandon(self.name());
            }
        }
    }
}

async fn response_listener(
    plugin: String,
    socket: Arc<LocalSocket>,
    pending: Arc<DashMap<String, PendingCall>>,
    on_event: EventCallback,
) {
    loop {
        match socket.read_line().await {
            Ok(Some(line)) => match SocketFrame::decode(&line) {
                Ok(SocketFrame::Response(response)) => match pending.remove(&response.id) {
                    Some((_, call)) => call.resolve(response),
                    None => debug!(plugin = %plugin, call_id = %response.id, "Response for unknown call"),
                },
                Ok(SocketFrame::Event(event)) => {
                    tokio::spawn(on_event(event.event, event.args));
                }
                Ok(other) => debug!(plugin = %plugin, frame = ?other, "Unexpected frame"),
                Err(e) => debug!(plugin = %plugin, error = %e, "Malformed frame"),
            },
            Ok(None) => debug!(plugin = %plugin, "Plugin socket closed"),
            Err(e) => {
                debug!(plugin = %plugin, error = %e, "Plugin socket read failed");
                if !socket.is_active() {
                    break;
                }
            }
        }
    }
}
