//! The process a plugin's backend runs in.
//!
//! The supervisor re-executes the loader binary with `sandbox --spec <json>`.
//! The sandbox switches identity, prepares the plugin environment, loads the
//! plugin code and serves its methods on the plugin socket until it receives
//! a termination signal.

pub mod bootstrap;
pub mod dispatch;
pub mod dylib;
pub mod environment;
pub mod module;
pub mod privilege;

pub use bootstrap::run;
pub use dispatch::{Convention, Dispatcher};
pub use dylib::DylibLoader;
pub use environment::PluginEnvironment;
pub use module::{
    CallArgs, EventEmitter, Hook, MethodTable, ModuleLoader, PluginContext, PluginModule,
    StaticLoader,
};
pub use privilege::{Identity, Privileges, SystemPrivileges};

use crate::error::SandboxError;
use crate::plugin::manifest::FLAG_ROOT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

/// Everything a sandbox needs to know about the plugin it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub name: String,
    pub author: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub api_version: u32,
    /// Backend entry point
    pub file: PathBuf,
    pub plugin_directory: String,
    /// Directory holding all plugins
    pub plugin_path: PathBuf,
    pub socket_path: PathBuf,
    pub homebrew_path: PathBuf,
    pub host_user: String,
    pub loader_version: String,
    #[serde(default)]
    pub passive: bool,
}

impl SandboxSpec {
    pub fn plugin_dir(&self) -> PathBuf {
        self.plugin_path.join(&self.plugin_directory)
    }

    pub fn is_root(&self) -> bool {
        self.flags.iter().any(|f| f == FLAG_ROOT)
    }

    pub fn from_json(json: &str) -> Result<Self, SandboxError> {
        serde_json::from_str(json)
            .map_err(|e| SandboxError::Environment(format!("Invalid sandbox spec: {e}")))
    }
}

/// Entry point of the `sandbox` subcommand.
///
/// Termination signals cancel the shutdown token, which runs the plugin's
/// shutdown hooks before returning.
pub async fn run_sandbox(spec: SandboxSpec) -> Result<(), SandboxError> {
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let plugin = spec.name.clone();
    tokio::spawn(async move {
        crate::shutdown_signal().await;
        info!(plugin = %plugin, "Termination signal received");
        token.cancel();
    });

    let span = info_span!("sandbox", plugin = %spec.name);
    let result = run(spec, &SystemPrivileges, &DylibLoader, shutdown)
        .instrument(span)
        .await;
    if let Err(e) = &result {
        error!(error = %e, "Sandbox failed");
    }
    result
}
