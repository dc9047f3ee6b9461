//! Hot reload: turns file changes under the plugin root into reload requests.

use super::manifest::{entry_point_name, MANIFEST_FILE};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A plugin to be re-imported by the reload worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub file: PathBuf,
    pub plugin_directory: String,
    /// Set for file-change triggers, which only reload plugins flagged `debug`
    pub refresh: bool,
}

/// Decides whether file changes may trigger reloads.
///
/// Closed until [`ReloadGate::enable`] and while any [`ReloadPause`] is held.
#[derive(Debug, Default)]
pub struct ReloadGate {
    enabled: AtomicBool,
    paused: AtomicUsize,
}

impl ReloadGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.paused.load(Ordering::SeqCst) == 0
    }

    pub fn pause(self: &Arc<Self>) -> ReloadPause {
        self.paused.fetch_add(1, Ordering::SeqCst);
        ReloadPause { gate: self.clone() }
    }
}

/// Keeps file-change reloads suspended until dropped.
#[must_use = "reloads resume as soon as the pause is dropped"]
pub struct ReloadPause {
    gate: Arc<ReloadGate>,
}

impl Drop for ReloadPause {
    fn drop(&mut self) {
        self.gate.paused.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FileChangeHandler {
    plugin_path: PathBuf,
    patterns: Vec<Regex>,
    gate: Arc<ReloadGate>,
    queue: mpsc::UnboundedSender<ReloadRequest>,
}

impl FileChangeHandler {
    pub fn new(
        plugin_path: PathBuf,
        gate: Arc<ReloadGate>,
        queue: mpsc::UnboundedSender<ReloadRequest>,
    ) -> Self {
        let entry = regex::escape(&entry_point_name());
        let patterns = [r"^.*?dist/index\.js$".to_string(), format!(r"^.*?{entry}$")]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        Self {
            plugin_path,
            patterns,
            gate,
            queue,
        }
    }

    pub fn handle_event(&self, event: &Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    self.maybe_reload(path);
                }
            }
            _ => {}
        }
    }

    /// Queues a reload for the plugin owning `path`; returns whether one was queued.
    pub fn maybe_reload(&self, path: &Path) -> bool {
        if !self.gate.is_open() || path.is_dir() {
            return false;
        }

        let text = path.to_string_lossy();
        if !self.patterns.iter().any(|p| p.is_match(&text)) {
            return false;
        }

        let Ok(relative) = path.strip_prefix(&self.plugin_path) else {
            return false;
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with("__")))
        {
            return false;
        }
        let Some(Component::Normal(directory)) = relative.components().next() else {
            return false;
        };
        let directory = directory.to_string_lossy().to_string();

        let plugin_dir = self.plugin_path.join(&directory);
        if !plugin_dir.join(MANIFEST_FILE).is_file() {
            return false;
        }

        debug!(path = %path.display(), plugin = %directory, "File change triggers reload");
        let request = ReloadRequest {
            file: plugin_dir.join(entry_point_name()),
            plugin_directory: directory,
            refresh: true,
        };
        self.queue.send(request).is_ok()
    }

    /// Starts watching the plugin root recursively.
    pub fn watch(self) -> notify::Result<RecommendedWatcher> {
        let root = self.plugin_path.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) => self.handle_event(&event),
                Err(e) => warn!(error = %e, "File watch error"),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileChangeHandler, mpsc::UnboundedReceiver<ReloadRequest>, Arc<ReloadGate>) {
        let root = TempDir::new().unwrap();
        let plugin = root.path().join("foo");
        std::fs::create_dir_all(plugin.join("dist")).unwrap();
        std::fs::write(plugin.join(MANIFEST_FILE), "{}").unwrap();

        let gate = Arc::new(ReloadGate::new());
        gate.enable();
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = FileChangeHandler::new(root.path().to_path_buf(), gate.clone(), tx);
        (root, handler, rx, gate)
    }

    #[test]
    fn test_matching_paths_are_queued() {
        let (root, handler, mut rx, _gate) = setup();

        assert!(handler.maybe_reload(&root.path().join("foo/dist/index.js")));
        let request = rx.try_recv().unwrap();
        assert_eq!(request.plugin_directory, "foo");
        assert_eq!(request.file, root.path().join("foo").join(entry_point_name()));
        assert!(request.refresh);

        assert!(handler.maybe_reload(&root.path().join("foo").join(entry_point_name())));
    }

    #[test]
    fn test_unrelated_paths_are_ignored() {
        let (root, handler, mut rx, _gate) = setup();

        assert!(!handler.maybe_reload(&root.path().join("foo/README.md")));
        assert!(!handler.maybe_reload(&root.path().join("foo/dist")));
        assert!(!handler.maybe_reload(&root.path().join("bar/dist/index.js")));
        assert!(!handler.maybe_reload(Path::new("/elsewhere/dist/index.js")));
        assert!(!handler.maybe_reload(&root.path().join("foo/__cache__/dist/index.js")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gate_blocks_reloads() {
        let (root, handler, mut rx, gate) = setup();
        let path = root.path().join("foo/dist/index.js");

        gate.disable();
        assert!(!handler.maybe_reload(&path));

        gate.enable();
        let pause = gate.pause();
        assert!(!handler.maybe_reload(&path));
        drop(pause);
        assert!(handler.maybe_reload(&path));

        assert_eq!(rx.try_recv().unwrap().plugin_directory, "foo");
        assert!(rx.try_recv().is_err());
    }
}
