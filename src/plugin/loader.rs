use super::manifest::{discover_plugin_dirs, entry_point_name, PluginLoadType, PluginManifest};
use super::watcher::{FileChangeHandler, ReloadGate, ReloadPause, ReloadRequest};
use super::wrapper::{EventCallback, PluginWrapper, SupervisorContext};
use crate::error::{LoaderError, PluginError, Result};
use crate::web::WsRouter;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const EVENT_IMPORT_PLUGIN: &str = "loader/import_plugin";
pub const EVENT_UNLOAD_PLUGIN: &str = "loader/unload_plugin";
pub const EVENT_PLUGIN_EVENT: &str = "loader/plugin_event";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub version: Option<String>,
    pub load_type: PluginLoadType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Loaded,
    /// A plugin of that name was loaded and did not opt into hot reload
    Skipped,
}

/// Registry of running plugins.
pub struct Loader {
    context: SupervisorContext,
    router: Arc<WsRouter>,
    plugins: DashMap<String, Arc<PluginWrapper>>,
    import_lock: Mutex<()>,
    reload_tx: mpsc::UnboundedSender<ReloadRequest>,
    reload_worker: JoinHandle<()>,
    gate: Arc<ReloadGate>,
    watcher: std::sync::Mutex<Option<notify::RecommendedWatcher>>,
}

impl Loader {
    /// Creates the loader and its reload worker. Must be called within a
    /// tokio runtime.
    pub fn new(context: SupervisorContext, router: Arc<WsRouter>) -> Arc<Self> {
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak: &Weak<Loader>| Self {
            context,
            router,
            plugins: DashMap::new(),
            import_lock: Mutex::new(()),
            reload_tx,
            reload_worker: tokio::spawn(handle_reloads(weak.clone(), reload_rx)),
            gate: Arc::new(ReloadGate::new()),
            watcher: std::sync::Mutex::new(None),
        })
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<PluginWrapper>> {
        self.plugins.get(name).map(|p| p.value().clone())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn gate(&self) -> &Arc<ReloadGate> {
        &self.gate
    }

    /// Loads the plugin in `directory`, replacing a running plugin of the
    /// same name.
    ///
    /// With `refresh` set, an already loaded plugin is only replaced when it
    /// carries the `debug` flag. With `batch` set, the UI is not notified.
    pub async fn import_plugin(
        &self,
        file: &Path,
        plugin_directory: &str,
        refresh: bool,
        batch: bool,
    ) -> Result<ImportOutcome> {
        let _guard = self.import_lock.lock().await;

        let manifest = PluginManifest::load(&self.context.plugin_path, plugin_directory)?;
        let name = manifest.name.clone();

        if let Some(existing) = self.plugin(&name) {
            if refresh && !manifest.is_debug() {
                info!(plugin = %name, "Plugin already loaded and has not opted into reloading");
                return Ok(ImportOutcome::Skipped);
            }
            info!(plugin = %name, "Plugin already loaded, stopping it before reimport");
            existing.stop(false).await;
            self.plugins.remove(&name);
        }

        let wrapper = Arc::new(PluginWrapper::new(
            manifest,
            file,
            plugin_directory,
            &self.context,
            self.event_forwarder(&name),
        )?);
        if wrapper.passive {
            info!(plugin = %name, "Plugin is passive");
        }
        wrapper.start().await?;
        self.plugins.insert(name.clone(), wrapper.clone());
        info!(plugin = %name, version = ?wrapper.version(), "Loaded plugin");

        if !batch {
            self.router
                .emit(
                    EVENT_IMPORT_PLUGIN,
                    json!([name, wrapper.version(), wrapper.load_type()]),
                )
                .await;
        }

        Ok(ImportOutcome::Loaded)
    }

    /// Imports every plugin directory under the plugin root; returns how many loaded.
    pub async fn import_plugins(&self) -> Result<usize> {
        let plugin_path = self.context.plugin_path.clone();
        info!(path = %plugin_path.display(), "Loading plugins");

        let mut loaded = 0;
        for directory in discover_plugin_dirs(&plugin_path)? {
            let file = plugin_path.join(&directory).join(entry_point_name());
            match self.import_plugin(&file, &directory, false, true).await {
                Ok(_) => loaded += 1,
                Err(e) => error!(plugin = %directory, error = %e, "Failed to load plugin"),
            }
        }

        Ok(loaded)
    }

    /// Queues a reload; the worker handles requests one at a time in order.
    pub fn enqueue_reload(&self, request: ReloadRequest) -> bool {
        self.reload_tx.send(request).is_ok()
    }

    /// Queues an unconditional reimport of a loaded plugin.
    pub fn reload_plugin(&self, name: &str) -> Result<()> {
        let plugin = self
            .plugin(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        self.enqueue_reload(ReloadRequest {
            file: plugin.file.clone(),
            plugin_directory: plugin.plugin_directory.clone(),
            refresh: false,
        });
        Ok(())
    }

    /// Maps file changes under the plugin root onto this loader's reload queue.
    pub fn file_change_handler(&self) -> FileChangeHandler {
        FileChangeHandler::new(
            self.context.plugin_path.clone(),
            self.gate.clone(),
            self.reload_tx.clone(),
        )
    }

    /// Watches the plugin root and opens the reload gate after `grace`.
    pub fn start_watcher(self: &Arc<Self>, grace: Duration) -> Result<()> {
        let watcher = self
            .file_change_handler()
            .watch()
            .map_err(|e| LoaderError::Io(std::io::Error::other(e.to_string())))?;
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }

        let gate = self.gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            gate.enable();
            info!("Hot reload enabled");
        });
        Ok(())
    }

    /// Suspends file-change reloads, e.g. while a plugin is being installed.
    pub fn pause_reloads(&self) -> ReloadPause {
        self.gate.pause()
    }

    pub async fn call_plugin_method(
        &self,
        plugin_name: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let plugin = self
            .plugin(plugin_name)
            .ok_or_else(|| PluginError::NotFound(plugin_name.to_string()))?;

        ensure_public(plugin_name, method)?;

        plugin.execute_method(method, args).await.map_err(|e| {
            debug!(plugin = %plugin_name, method = %method, error = %e, "Plugin method failed");
            e
        })
    }

    /// Keyword-argument call; failures are reported in the result instead of raised.
    pub async fn call_legacy_plugin_method(
        &self,
        plugin_name: &str,
        method: &str,
        kwargs: Map<String, Value>,
    ) -> Value {
        match self.legacy_call(plugin_name, method, kwargs).await {
            Ok(result) => json!({"success": true, "result": result}),
            Err(e) => {
                debug!(plugin = %plugin_name, method = %method, error = %e, "Legacy method failed");
                json!({"success": false, "result": legacy_error_text(&e)})
            }
        }
    }

    async fn legacy_call(
        &self,
        plugin_name: &str,
        method: &str,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let plugin = self
            .plugin(plugin_name)
            .ok_or_else(|| PluginError::NotFound(plugin_name.to_string()))?;
        ensure_public(plugin_name, method)?;
        plugin.execute_legacy_method(method, kwargs).await
    }

    pub fn get_plugins(&self) -> Vec<PluginSummary> {
        let mut plugins: Vec<PluginSummary> = self
            .plugins
            .iter()
            .map(|entry| PluginSummary {
                name: entry.key().clone(),
                version: entry.value().version().map(str::to_string),
                load_type: entry.value().load_type(),
            })
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        plugins
    }

    /// Stops and forgets a plugin, telling the UI to drop its frontend.
    pub async fn unload_plugin(&self, name: &str, uninstall: bool) -> Result<()> {
        let _guard = self.import_lock.lock().await;

        let (_, plugin) = self
            .plugins
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        self.router.emit(EVENT_UNLOAD_PLUGIN, json!([name])).await;
        plugin.stop(uninstall).await;
        info!(plugin = %name, uninstall, "Unloaded plugin");
        Ok(())
    }

    /// Stops every plugin concurrently.
    pub async fn shutdown_plugins(&self) {
        self.gate.disable();
        let plugins: Vec<Arc<PluginWrapper>> =
            self.plugins.iter().map(|e| e.value().clone()).collect();
        info!(count = plugins.len(), "Stopping plugins");

        futures::future::join_all(plugins.iter().map(|p| p.stop(false))).await;
        self.plugins.clear();
    }

    /// Registers the host routes the UI uses to manage plugins.
    pub fn register_routes(self: &Arc<Self>, router: &WsRouter) {
        let loader = self.clone();
        router.add_route("loader/get_plugins", move |_args| {
            let loader = loader.clone();
            async move { Ok::<_, LoaderError>(serde_json::to_value(loader.get_plugins())?) }
        });

        let loader = self.clone();
        router.add_route("loader/reload_plugin", move |args| {
            let loader = loader.clone();
            async move {
                let name = string_arg(&args, 0, "plugin name")?;
                loader.reload_plugin(&name)?;
                Ok::<_, LoaderError>(Value::Null)
            }
        });

        let loader = self.clone();
        router.add_route("loader/call_plugin_method", move |args| {
            let loader = loader.clone();
            async move {
                let plugin = string_arg(&args, 0, "plugin name")?;
                let method = string_arg(&args, 1, "method name")?;
                let rest = args.into_iter().skip(2).collect();
                loader.call_plugin_method(&plugin, &method, rest).await
            }
        });

        let loader = self.clone();
        router.add_route("loader/call_legacy_plugin_method", move |args| {
            let loader = loader.clone();
            async move {
                let plugin = string_arg(&args, 0, "plugin name")?;
                let method = string_arg(&args, 1, "method name")?;
                let kwargs = match args.get(2) {
                    Some(Value::Object(kwargs)) => kwargs.clone(),
                    None | Some(Value::Null) => Map::new(),
                    Some(other) => {
                        return Err(LoaderError::InvalidArguments(format!(
                            "keyword arguments must be an object, got {other}"
                        )))
                    }
                };
                Ok(loader.call_legacy_plugin_method(&plugin, &method, kwargs).await)
            }
        });
    }

    fn event_forwarder(&self, plugin: &str) -> EventCallback {
        let router = self.router.clone();
        let plugin = plugin.to_string();
        Arc::new(move |event: String, args: Value| {
            let router = router.clone();
            let plugin = plugin.clone();
            async move {
                debug!(plugin = %plugin, event = %event, "Forwarding plugin event");
                router
                    .emit(
                        EVENT_PLUGIN_EVENT,
                        json!({"plugin": plugin, "event": event, "args": args}),
                    )
                    .await;
            }
            .boxed()
        })
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.reload_worker.abort();
    }
}

async fn handle_reloads(loader: Weak<Loader>, mut queue: mpsc::UnboundedReceiver<ReloadRequest>) {
    while let Some(request) = queue.recv().await {
        let Some(loader) = loader.upgrade() else {
            break;
        };
        debug!(plugin = %request.plugin_directory, refresh = request.refresh, "Processing reload");
        if let Err(e) = loader
            .import_plugin(&request.file, &request.plugin_directory, request.refresh, false)
            .await
        {
            warn!(plugin = %request.plugin_directory, error = %e, "Reload failed");
        }
    }
}

fn string_arg(args: &[Value], index: usize, what: &str) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LoaderError::InvalidArguments(format!("missing {what} at position {index}")))
}

/// Methods starting with `_` are private to the plugin.
fn ensure_public(plugin: &str, method: &str) -> Result<()> {
    if method.starts_with('_') {
        return Err(PluginError::PrivateMethod {
            plugin: plugin.to_string(),
            method: method.to_string(),
        }
        .into());
    }
    Ok(())
}

fn legacy_error_text(err: &LoaderError) -> String {
    match err {
        LoaderError::Plugin(PluginError::MethodFailed(message)) => message.clone(),
        other => other.to_string(),
    }
}
