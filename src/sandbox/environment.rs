//! Environment variables and directories every plugin can rely on.

use super::SandboxSpec;
use crate::error::SandboxError;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const SETTINGS_DIR: &str = "settings";
pub const RUNTIME_DIR: &str = "data";
pub const LOG_DIR: &str = "logs";

/// Subdirectory of a plugin holding shared libraries it links against.
pub const MODULES_DIR: &str = "lib";

#[derive(Debug, Clone)]
pub struct PluginEnvironment {
    vars: BTreeMap<String, String>,
    pub settings_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub log_dir: PathBuf,
    pub modules_dir: PathBuf,
}

impl PluginEnvironment {
    /// `user`/`home` describe the identity the plugin runs as, while
    /// `host_home` is the home of the unprivileged host user.
    pub fn new(spec: &SandboxSpec, user: &str, home: PathBuf, host_home: PathBuf) -> Self {
        let settings_dir = spec.homebrew_path.join(SETTINGS_DIR).join(&spec.plugin_directory);
        let runtime_dir = spec.homebrew_path.join(RUNTIME_DIR).join(&spec.plugin_directory);
        let log_dir = spec.homebrew_path.join(LOG_DIR).join(&spec.plugin_directory);
        let plugin_dir = spec.plugin_dir();
        let modules_dir = plugin_dir.join(MODULES_DIR);

        let mut vars = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set("HOME", home.display().to_string());
        set("USER", user.to_string());
        set("DECKY_VERSION", spec.loader_version.clone());
        set("DECKY_USER", spec.host_user.clone());
        set("DECKY_USER_HOME", host_home.display().to_string());
        set("DECKY_HOME", spec.homebrew_path.display().to_string());
        set("DECKY_PLUGIN_SETTINGS_DIR", settings_dir.display().to_string());
        set("DECKY_PLUGIN_DIR", plugin_dir.display().to_string());
        set("DECKY_PLUGIN_NAME", spec.name.clone());
        set("DECKY_PLUGIN_AUTHOR", spec.author.clone());
        set(
            "DECKY_PLUGIN_VERSION",
            spec.version.clone().unwrap_or_default(),
        );
        set("DECKY_PLUGIN_RUNTIME_DIR", runtime_dir.display().to_string());
        set("DECKY_PLUGIN_LOG_DIR", log_dir.display().to_string());
        set("DECKY_PLUGIN_MODULES_DIR", modules_dir.display().to_string());

        Self {
            vars,
            settings_dir,
            runtime_dir,
            log_dir,
            modules_dir,
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Ensures the per-plugin directories exist.
    pub fn prepare(&self) -> Result<(), SandboxError> {
        for dir in [&self.settings_dir, &self.runtime_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                SandboxError::Environment(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Exports the variables into this process.
    ///
    /// Must run before plugin code is loaded and before any other thread
    /// reads the environment.
    pub fn apply(&self) {
        for (key, value) in &self.vars {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn spec(homebrew: &Path) -> SandboxSpec {
        SandboxSpec {
            name: "Demo".to_string(),
            author: "someone".to_string(),
            version: Some("0.1.0".to_string()),
            flags: vec![],
            api_version: 1,
            file: homebrew.join("plugins/demo/main.so"),
            plugin_directory: "demo".to_string(),
            plugin_path: homebrew.join("plugins"),
            socket_path: homebrew.join("sock"),
            homebrew_path: homebrew.to_path_buf(),
            host_user: "deck".to_string(),
            loader_version: "3.0.0".to_string(),
            passive: false,
        }
    }

    #[test]
    fn test_environment_contract() {
        let homebrew = Path::new("/home/deck/homebrew");
        let env = PluginEnvironment::new(
            &spec(homebrew),
            "deck",
            PathBuf::from("/home/deck"),
            PathBuf::from("/home/deck"),
        );

        assert_eq!(env.get("HOME"), Some("/home/deck"));
        assert_eq!(env.get("USER"), Some("deck"));
        assert_eq!(env.get("DECKY_VERSION"), Some("3.0.0"));
        assert_eq!(env.get("DECKY_HOME"), Some("/home/deck/homebrew"));
        assert_eq!(
            env.get("DECKY_PLUGIN_SETTINGS_DIR"),
            Some("/home/deck/homebrew/settings/demo")
        );
        assert_eq!(
            env.get("DECKY_PLUGIN_RUNTIME_DIR"),
            Some("/home/deck/homebrew/data/demo")
        );
        assert_eq!(
            env.get("DECKY_PLUGIN_LOG_DIR"),
            Some("/home/deck/homebrew/logs/demo")
        );
        assert_eq!(
            env.get("DECKY_PLUGIN_DIR"),
            Some("/home/deck/homebrew/plugins/demo")
        );
        assert_eq!(env.get("DECKY_PLUGIN_NAME"), Some("Demo"));
        assert_eq!(env.get("DECKY_PLUGIN_VERSION"), Some("0.1.0"));
    }

    #[test]
    fn test_root_identity_keeps_host_user_fields() {
        let homebrew = Path::new("/home/deck/homebrew");
        let env = PluginEnvironment::new(
            &spec(homebrew),
            "root",
            PathBuf::from("/root"),
            PathBuf::from("/home/deck"),
        );

        assert_eq!(env.get("HOME"), Some("/root"));
        assert_eq!(env.get("USER"), Some("root"));
        assert_eq!(env.get("DECKY_USER"), Some("deck"));
        assert_eq!(env.get("DECKY_USER_HOME"), Some("/home/deck"));
    }

    #[test]
    fn test_prepare_creates_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = PluginEnvironment::new(
            &spec(dir.path()),
            "deck",
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        );
        env.prepare().unwrap();

        assert!(dir.path().join("settings/demo").is_dir());
        assert!(dir.path().join("data/demo").is_dir());
        assert!(dir.path().join("logs/demo").is_dir());
    }
}
