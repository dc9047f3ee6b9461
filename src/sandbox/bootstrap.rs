use super::environment::PluginEnvironment;
use super::module::{EventEmitter, Hook, ModuleLoader, PluginContext, PluginModule};
use super::privilege::{home_dir_of, Identity, Privileges};
use super::{Dispatcher, SandboxSpec};
use crate::error::SandboxError;
use crate::transport::{LocalSocket, MessageHandler};
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs a plugin inside the current process until `shutdown` is cancelled.
///
/// Errors before serving abort startup; the process is expected to exit with
/// a failure status. Failures of the unload and uninstall hooks are only
/// logged.
pub async fn run(
    spec: SandboxSpec,
    privileges: &dyn Privileges,
    loader: &dyn ModuleLoader,
    shutdown: CancellationToken,
) -> Result<(), SandboxError> {
    if spec.passive {
        debug!(plugin = %spec.name, "Passive plugin, nothing to run");
        return Ok(());
    }

    let identity = Identity::for_plugin(spec.is_root(), &spec.host_user);
    privileges.drop_to(&identity)?;

    let environment = PluginEnvironment::new(
        &spec,
        identity.user_name(),
        home_dir_of(identity.user_name()),
        home_dir_of(&spec.host_user),
    );
    environment.prepare()?;
    environment.apply();

    let socket = Arc::new(LocalSocket::new(
        spec.socket_path.clone(),
        1,
        Duration::from_millis(0),
    ));

    let context = PluginContext {
        environment: environment.vars().clone(),
        modules_dir: environment.modules_dir.clone(),
        spec: spec.clone(),
    };
    let module = loader.load(&spec.file, &context, EventEmitter::new(socket.clone()))?;
    info!(plugin = %spec.name, api_version = spec.api_version, "Plugin code loaded");

    if module.has_hook(Hook::Migrate) {
        module.run_hook(Hook::Migrate).await.map_err(|reason| SandboxError::Hook {
            hook: Hook::Migrate.name(),
            reason,
        })?;
    }

    let main_failure = Arc::new(Mutex::new(None));
    let main_task = module.has_hook(Hook::Main).then(|| {
        let module = module.clone();
        let failure = main_failure.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(reason) = module.run_hook(Hook::Main).await {
                if let Ok(mut slot) = failure.lock() {
                    *slot = Some(reason);
                }
                shutdown.cancel();
            }
        })
    });

    let dispatcher = Dispatcher::new(module.clone(), spec.api_version);
    let handler_dispatcher = dispatcher.clone();
    let handler: MessageHandler = Arc::new(move |line: String| {
        let dispatcher = handler_dispatcher.clone();
        async move { dispatcher.on_message(line).await }.boxed()
    });
    socket
        .serve(handler)
        .await
        .map_err(|e| SandboxError::Environment(e.to_string()))?;
    info!(plugin = %spec.name, socket = %spec.socket_path.display(), "Sandbox ready");

    shutdown.cancelled().await;

    let failure = main_failure.lock().ok().and_then(|mut slot| slot.take());
    if let Some(reason) = failure {
        error!(plugin = %spec.name, error = %reason, "Main hook failed");
        socket.close().await;
        return Err(SandboxError::Hook {
            hook: Hook::Main.name(),
            reason,
        });
    }

    info!(plugin = %spec.name, "Shutting down plugin");
    if let Some(task) = main_task {
        task.abort();
    }
    run_shutdown_hooks(&spec.name, module.as_ref(), dispatcher.uninstalling()).await;
    socket.close().await;

    Ok(())
}

async fn run_shutdown_hooks(plugin: &str, module: &dyn PluginModule, uninstalling: bool) {
    let mut hooks = vec![Hook::Unload];
    if uninstalling {
        hooks.push(Hook::Uninstall);
    }

    for hook in hooks {
        if !module.has_hook(hook) {
            continue;
        }
        debug!(plugin = %plugin, hook = hook.name(), "Running shutdown hook");
        if let Err(e) = module.run_hook(hook).await {
            warn!(plugin = %plugin, hook = hook.name(), error = %e, "Shutdown hook failed");
        }
    }
}
