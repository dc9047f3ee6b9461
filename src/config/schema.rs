use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Directory holding one sub-directory per installed plugin
    #[serde(default = "default_plugin_path")]
    pub plugin_path: PathBuf,
    /// Loader root; per-plugin settings, data and logs live below it
    #[serde(default = "default_homebrew_path")]
    pub homebrew_path: PathBuf,
    /// Unprivileged user that plugins run as unless flagged `root`
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_live_reload")]
    pub live_reload: bool,
    #[serde(default = "default_reload_grace_ms")]
    pub reload_grace_ms: u64,
    /// When set, host logs are also written to `<log_dir>/loader.log`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SandboxConfig {
    /// Program that runs the sandbox bootstrap (default: this executable)
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Arguments placed before the `sandbox` subcommand
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_control_frame_timeout_ms")]
    pub control_frame_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_path: default_plugin_path(),
            homebrew_path: default_homebrew_path(),
            user: None,
            live_reload: default_live_reload(),
            reload_grace_ms: default_reload_grace_ms(),
            log_dir: None,
            server: ServerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            socket_dir: default_socket_dir(),
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            control_frame_timeout_ms: default_control_frame_timeout_ms(),
        }
    }
}

// Default value functions
fn default_homebrew_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join("homebrew")
}

fn default_plugin_path() -> PathBuf {
    default_homebrew_path().join("plugins")
}

fn default_live_reload() -> bool {
    true
}

fn default_reload_grace_ms() -> u64 {
    10_000
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    1337
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_connect_retries() -> u32 {
    10
}

fn default_connect_backoff_ms() -> u64 {
    2000
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_control_frame_timeout_ms() -> u64 {
    1000
}

impl Config {
    pub fn reload_grace(&self) -> Duration {
        Duration::from_millis(self.reload_grace_ms)
    }

    /// User plugins are dropped to when not flagged `root`.
    ///
    /// Falls back to the user that invoked a privileged launch (`SUDO_USER`),
    /// then to the current login.
    pub fn host_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("SUDO_USER").ok())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }
}

impl SandboxConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn control_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.control_frame_timeout_ms)
    }
}
