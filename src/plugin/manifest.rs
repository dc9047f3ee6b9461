//! Per-plugin metadata files.
//!
//! `plugin.json` is required and names the plugin; `package.json` is optional
//! and supplies the version and the UI bundle's load strategy.

use crate::error::ManifestError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "plugin.json";
pub const PACKAGE_FILE: &str = "package.json";

pub const FLAG_ROOT: &str = "root";
pub const FLAG_DEBUG: &str = "debug";

/// File name of a plugin's backend entry point (`main.so` on Linux).
pub fn entry_point_name() -> String {
    format!("main{}", std::env::consts::DLL_SUFFIX)
}

/// How the UI should load the plugin's frontend bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PluginLoadType {
    /// Bundle is evaluated as a global script
    LegacyEvalIife,
    /// Bundle is imported as an ES module
    EsModuleV1,
}

impl From<PluginLoadType> for u8 {
    fn from(load_type: PluginLoadType) -> u8 {
        match load_type {
            PluginLoadType::LegacyEvalIife => 0,
            PluginLoadType::EsModuleV1 => 1,
        }
    }
}

impl TryFrom<u8> for PluginLoadType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PluginLoadType::LegacyEvalIife),
            1 => Ok(PluginLoadType::EsModuleV1),
            other => Err(format!("unknown plugin load type {other}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: String,
    author: String,
    flags: Vec<String>,
    #[serde(default)]
    api_version: u32,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    #[serde(default)]
    version: Option<String>,
    #[serde(default, rename = "type")]
    module_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    pub name: String,
    pub author: String,
    pub flags: Vec<String>,
    pub api_version: u32,
    pub version: Option<String>,
    pub load_type: PluginLoadType,
}

impl PluginManifest {
    /// Reads the metadata of `<plugin_root>/<directory>`.
    pub fn load(plugin_root: &Path, directory: &str) -> Result<Self, ManifestError> {
        let dir = plugin_root.join(directory);

        let raw: RawManifest = read_json(&dir.join(MANIFEST_FILE))?;

        let package_path = dir.join(PACKAGE_FILE);
        let (version, load_type) = if package_path.is_file() {
            let package: RawPackage = read_json(&package_path)?;
            let load_type = match package.module_type.as_deref() {
                Some("module") => PluginLoadType::EsModuleV1,
                _ => PluginLoadType::LegacyEvalIife,
            };
            (package.version, load_type)
        } else {
            (None, PluginLoadType::LegacyEvalIife)
        };

        if raw.name.trim().is_empty() {
            return Err(ManifestError::Invalid {
                path: dir.join(MANIFEST_FILE).display().to_string(),
                reason: "name must not be empty".to_string(),
            });
        }

        Ok(Self {
            name: raw.name,
            author: raw.author,
            flags: raw.flags,
            api_version: raw.api_version,
            version,
            load_type,
        })
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Plugin keeps root privileges inside its sandbox
    pub fn is_root(&self) -> bool {
        self.has_flag(FLAG_ROOT)
    }

    /// Plugin opted into being re-imported on file changes
    pub fn is_debug(&self) -> bool {
        self.has_flag(FLAG_DEBUG)
    }
}

/// Directories under `plugin_root` that contain a manifest, sorted by name.
pub fn discover_plugin_dirs(plugin_root: &Path) -> std::io::Result<Vec<String>> {
    let mut dirs = Vec::new();

    for entry in std::fs::read_dir(plugin_root)? {
        let path: PathBuf = entry?.path();
        if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                dirs.push(name.to_string());
            }
        }
    }

    dirs.sort();
    Ok(dirs)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ManifestError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    serde_json::from_str(&contents).map_err(|e| ManifestError::Invalid {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plugin(root: &Path, dir: &str, manifest: &str, package: Option<&str>) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(MANIFEST_FILE), manifest).unwrap();
        if let Some(package) = package {
            std::fs::write(path.join(PACKAGE_FILE), package).unwrap();
        }
    }

    #[test]
    fn test_minimal_manifest_defaults() {
        let root = TempDir::new().unwrap();
        write_plugin(
            root.path(),
            "foo",
            r#"{"name":"Foo","author":"x","flags":[]}"#,
            None,
        );

        let manifest = PluginManifest::load(root.path(), "foo").unwrap();
        assert_eq!(manifest.name, "Foo");
        assert_eq!(manifest.api_version, 0);
        assert_eq!(manifest.version, None);
        assert_eq!(manifest.load_type, PluginLoadType::LegacyEvalIife);
        assert!(!manifest.is_debug());
        assert!(!manifest.is_root());
    }

    #[test]
    fn test_package_selects_module_load_type() {
        let root = TempDir::new().unwrap();
        write_plugin(
            root.path(),
            "bar",
            r#"{"name":"Bar","author":"y","flags":["debug","root"],"api_version":1}"#,
            Some(r#"{"version":"1.2.3","type":"module"}"#),
        );

        let manifest = PluginManifest::load(root.path(), "bar").unwrap();
        assert_eq!(manifest.version.as_deref(), Some("1.2.3"));
        assert_eq!(manifest.load_type, PluginLoadType::EsModuleV1);
        assert_eq!(manifest.api_version, 1);
        assert!(manifest.is_debug());
        assert!(manifest.is_root());
    }

    #[test]
    fn test_missing_and_invalid_manifests() {
        let root = TempDir::new().unwrap();
        assert!(matches!(
            PluginManifest::load(root.path(), "absent"),
            Err(ManifestError::Read { .. })
        ));

        write_plugin(root.path(), "broken", r#"{"name":"Broken"}"#, None);
        assert!(matches!(
            PluginManifest::load(root.path(), "broken"),
            Err(ManifestError::Invalid { .. })
        ));
    }

    #[test]
    fn test_discover_only_dirs_with_manifest() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "b", r#"{"name":"B","author":"x","flags":[]}"#, None);
        write_plugin(root.path(), "a", r#"{"name":"A","author":"x","flags":[]}"#, None);
        std::fs::create_dir_all(root.path().join("not-a-plugin")).unwrap();
        std::fs::write(root.path().join("stray.txt"), "").unwrap();

        let dirs = discover_plugin_dirs(root.path()).unwrap();
        assert_eq!(dirs, vec!["a".to_string(), "b".to_string()]);
    }
}
