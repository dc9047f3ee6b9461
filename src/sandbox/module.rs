//! The interface between a sandbox and the plugin code it hosts.

use super::SandboxSpec;
use crate::error::{SandboxError, TransportError};
use crate::transport::{EventFrame, LocalSocket, SocketFrame};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle entry points a plugin may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Migrate,
    Main,
    Unload,
    Uninstall,
}

impl Hook {
    pub fn name(&self) -> &'static str {
        match self {
            Hook::Migrate => "_migration",
            Hook::Main => "_main",
            Hook::Unload => "_unload",
            Hook::Uninstall => "_uninstall",
        }
    }
}

/// Arguments of a plugin method, shaped by the plugin's calling convention.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgs {
    Positional(Vec<Value>),
    Keyword(Map<String, Value>),
}

impl CallArgs {
    pub fn into_value(self) -> Value {
        match self {
            CallArgs::Positional(args) => Value::Array(args),
            CallArgs::Keyword(kwargs) => Value::Object(kwargs),
        }
    }
}

/// Loaded plugin code. Errors are plain messages that travel back to the
/// caller in a failed response frame.
#[async_trait]
pub trait PluginModule: Send + Sync {
    fn has_hook(&self, hook: Hook) -> bool;

    async fn run_hook(&self, hook: Hook) -> Result<(), String>;

    async fn call(&self, method: &str, args: CallArgs) -> Result<Value, String>;
}

/// What a loader knows about the plugin it is loading.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub spec: SandboxSpec,
    pub environment: BTreeMap<String, String>,
    pub modules_dir: PathBuf,
}

/// Handle plugin code uses to push events to the frontend.
#[derive(Clone)]
pub struct EventEmitter {
    socket: Arc<LocalSocket>,
}

impl EventEmitter {
    pub fn new(socket: Arc<LocalSocket>) -> Self {
        Self { socket }
    }

    pub async fn emit(&self, event: &str, args: Value) -> Result<(), TransportError> {
        let frame = SocketFrame::from(EventFrame::new(event, args));
        self.socket.write_line_server(&frame.encode()).await
    }
}

pub trait ModuleLoader: Send + Sync {
    fn load(
        &self,
        entry: &Path,
        context: &PluginContext,
        emitter: EventEmitter,
    ) -> Result<Arc<dyn PluginModule>, SandboxError>;
}

pub type ModuleFactory =
    Arc<dyn Fn(&PluginContext, EventEmitter) -> Arc<dyn PluginModule> + Send + Sync>;

/// Resolves entry points against modules compiled into the host binary.
#[derive(Default, Clone)]
pub struct StaticLoader {
    factories: HashMap<PathBuf, ModuleFactory>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, entry: impl Into<PathBuf>, factory: F) -> Self
    where
        F: Fn(&PluginContext, EventEmitter) -> Arc<dyn PluginModule> + Send + Sync + 'static,
    {
        self.factories.insert(entry.into(), Arc::new(factory));
        self
    }
}

impl ModuleLoader for StaticLoader {
    fn load(
        &self,
        entry: &Path,
        context: &PluginContext,
        emitter: EventEmitter,
    ) -> Result<Arc<dyn PluginModule>, SandboxError> {
        let factory = self.factories.get(entry).ok_or_else(|| SandboxError::Load {
            path: entry.display().to_string(),
            reason: "no module registered for this entry point".to_string(),
        })?;
        Ok(factory(context, emitter))
    }
}

pub type MethodFn = Arc<dyn Fn(CallArgs) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
pub type HookFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// A plugin assembled from closures, keyed by method and hook name.
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
    hooks: HashMap<Hook, HookFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallArgs) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    pub fn hook<F>(mut self, hook: Hook, f: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        self.hooks.insert(hook, Arc::new(f));
        self
    }
}

#[async_trait]
impl PluginModule for MethodTable {
    fn has_hook(&self, hook: Hook) -> bool {
        self.hooks.contains_key(&hook)
    }

    async fn run_hook(&self, hook: Hook) -> Result<(), String> {
        match self.hooks.get(&hook) {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    async fn call(&self, method: &str, args: CallArgs) -> Result<Value, String> {
        let f = self
            .methods
            .get(method)
            .ok_or_else(|| format!("Plugin has no method named {method}"))?;
        f(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_method_table_dispatch() {
        let table = MethodTable::new()
            .method("add", |args| {
                async move {
                    match args {
                        CallArgs::Positional(values) => {
                            let sum: i64 = values.iter().filter_map(Value::as_i64).sum();
                            Ok(json!(sum))
                        }
                        CallArgs::Keyword(_) => Err("expected positional".to_string()),
                    }
                }
                .boxed()
            })
            .hook(Hook::Main, || async { Ok(()) }.boxed());

        let result = table
            .call("add", CallArgs::Positional(vec![json!(1), json!(2)]))
            .await
            .unwrap();
        assert_eq!(result, json!(3));

        assert!(table.call("missing", CallArgs::Positional(vec![])).await.is_err());
        assert!(table.has_hook(Hook::Main));
        assert!(!table.has_hook(Hook::Unload));
        assert!(table.run_hook(Hook::Unload).await.is_ok());
    }

    #[test]
    fn test_call_args_to_value() {
        let mut kwargs = Map::new();
        kwargs.insert("k".to_string(), json!("v"));
        assert_eq!(CallArgs::Keyword(kwargs).into_value(), json!({"k": "v"}));
        assert_eq!(CallArgs::Positional(vec![json!(1)]).into_value(), json!([1]));
    }
}
