//! Plugin supervision on the host side.
//!
//! Each plugin with a backend runs in its own sandbox process. A
//! [`PluginWrapper`] owns that process and the socket used to call into it;
//! the [`Loader`] keeps one wrapper per plugin name and re-imports plugins
//! when their files change.
//!
//! # Modules
//!
//! - `manifest`: `plugin.json` / `package.json` parsing
//! - `process`: sandbox spawning and termination
//! - `request`: calls awaiting a response
//! - `wrapper`: one running plugin
//! - `loader`: the registry, UI routes and reload worker
//! - `watcher`: file-change driven reloads

pub mod loader;
pub mod manifest;
pub mod process;
pub mod request;
pub mod watcher;
pub mod wrapper;

pub use loader::{ImportOutcome, Loader, PluginSummary};
pub use manifest::{PluginLoadType, PluginManifest};
pub use process::SandboxLauncher;
pub use watcher::{FileChangeHandler, ReloadGate, ReloadPause, ReloadRequest};
pub use wrapper::{EventCallback, PluginWrapper, SupervisorContext};
