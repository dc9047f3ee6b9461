//! Loads plugin backends compiled as shared libraries.
//!
//! A backend exports a small C ABI:
//!
//! - `decky_plugin_call(method, args_json, out) -> i32` (required)
//! - `decky_plugin_free(ptr)` (required), releases strings handed to the host
//! - `decky_plugin_init(emit) -> i32` (optional), receives the event callback
//! - `decky_plugin_migrate`, `decky_plugin_main`, `decky_plugin_unload`,
//!   `decky_plugin_uninstall` (optional), each `fn(out) -> i32`
//!
//! A zero status means success. On success `out` holds a JSON result, on
//! failure an error message; either may be null.

use super::module::{CallArgs, EventEmitter, Hook, ModuleLoader, PluginContext, PluginModule};
use crate::error::SandboxError;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use libloading::Library;
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, warn};

type CallFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut c_char) -> i32;
type FreeFn = unsafe extern "C" fn(*mut c_char);
type HookFn = unsafe extern "C" fn(*mut *mut c_char) -> i32;
type EmitFn = extern "C" fn(*const c_char, *const c_char);
type InitFn = unsafe extern "C" fn(EmitFn) -> i32;

const CALL_SYMBOL: &[u8] = b"decky_plugin_call";
const FREE_SYMBOL: &[u8] = b"decky_plugin_free";
const INIT_SYMBOL: &[u8] = b"decky_plugin_init";

// Set once per sandbox process; each sandbox hosts exactly one plugin
static EMITTER: Mutex<Option<(Handle, EventEmitter)>> = Mutex::new(None);

extern "C" fn emit_event(event: *const c_char, args_json: *const c_char) {
    if event.is_null() {
        return;
    }
    // SAFETY: the plugin passes NUL-terminated strings valid for this call.
    let event = unsafe { CStr::from_ptr(event) }.to_string_lossy().into_owned();
    let args = if args_json.is_null() {
        Value::Null
    } else {
        // SAFETY: as above.
        let text = unsafe { CStr::from_ptr(args_json) }.to_string_lossy();
        serde_json::from_str(&text).unwrap_or(Value::String(text.into_owned()))
    };

    let slot = match EMITTER.lock() {
        Ok(slot) => slot.clone(),
        Err(_) => return,
    };
    match slot {
        Some((handle, emitter)) => {
            handle.spawn(async move {
                if let Err(e) = emitter.emit(&event, args).await {
                    debug!(event = %event, error = %e, "Dropped plugin event");
                }
            });
        }
        None => warn!(event = %event, "Plugin emitted an event before it was initialised"),
    }
}

fn hook_symbol(hook: Hook) -> &'static [u8] {
    match hook {
        Hook::Migrate => b"decky_plugin_migrate",
        Hook::Main => b"decky_plugin_main",
        Hook::Unload => b"decky_plugin_unload",
        Hook::Uninstall => b"decky_plugin_uninstall",
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn load(
        &self,
        entry: &Path,
        context: &PluginContext,
        emitter: EventEmitter,
    ) -> Result<Arc<dyn PluginModule>, SandboxError> {
        load_module(entry, context, emitter)
            .map(|module| Arc::new(module) as Arc<dyn PluginModule>)
            .map_err(|e| SandboxError::Load {
                path: entry.display().to_string(),
                reason: format!("{e:#}"),
            })
    }
}

struct DylibModule {
    call: CallFn,
    free: FreeFn,
    hooks: HashMap<Hook, HookFn>,
    lib: Arc<Library>,
    _dependencies: Vec<Library>,
}

fn load_module(
    entry: &Path,
    context: &PluginContext,
    emitter: EventEmitter,
) -> anyhow::Result<DylibModule> {
    let dependencies = preload_dependencies(&context.modules_dir)?;

    // SAFETY: Initialisers of the library run here; the plugin is trusted to
    // the extent of the sandbox process it runs in.
    let lib = unsafe { Library::new(entry) }
        .with_context(|| format!("failed to load plugin library {}", entry.display()))?;

    // SAFETY: Symbol types follow the documented plugin ABI.
    let call: CallFn = unsafe {
        *lib.get::<CallFn>(CALL_SYMBOL)
            .with_context(|| format!("missing symbol decky_plugin_call in {}", entry.display()))?
    };
    // SAFETY: as above.
    let free: FreeFn = unsafe {
        *lib.get::<FreeFn>(FREE_SYMBOL)
            .with_context(|| format!("missing symbol decky_plugin_free in {}", entry.display()))?
    };

    let mut hooks = HashMap::new();
    for hook in [Hook::Migrate, Hook::Main, Hook::Unload, Hook::Uninstall] {
        // SAFETY: as above; hooks are optional so a missing symbol is skipped.
        if let Ok(symbol) = unsafe { lib.get::<HookFn>(hook_symbol(hook)) } {
            hooks.insert(hook, *symbol);
        }
    }

    let handle = Handle::try_current().context("plugin loading requires a tokio runtime")?;
    if let Ok(mut slot) = EMITTER.lock() {
        *slot = Some((handle, emitter));
    }

    // SAFETY: as above.
    if let Ok(init) = unsafe { lib.get::<InitFn>(INIT_SYMBOL) } {
        // SAFETY: emit_event lives for the whole process.
        let status = unsafe { init(emit_event) };
        if status != 0 {
            return Err(anyhow!("decky_plugin_init returned status {status}"));
        }
    }

    debug!(
        plugin = %context.spec.name,
        hooks = hooks.len(),
        "Loaded plugin library"
    );

    Ok(DylibModule {
        call,
        free,
        hooks,
        lib: Arc::new(lib),
        _dependencies: dependencies,
    })
}

/// Opens every shared library in `dir` with global symbol visibility so the
/// plugin's own library can resolve against them.
fn preload_dependencies(dir: &Path) -> anyhow::Result<Vec<Library>> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().and_then(|e| e.to_str()) == Some(std::env::consts::DLL_EXTENSION)
        })
        .collect();
    paths.sort();

    let mut libraries = Vec::with_capacity(paths.len());
    for path in paths {
        // SAFETY: see load_module.
        let lib = unsafe { UnixLibrary::open(Some(&path), RTLD_NOW | RTLD_GLOBAL) }
            .with_context(|| format!("failed to preload {}", path.display()))?;
        debug!(path = %path.display(), "Preloaded plugin dependency");
        libraries.push(Library::from(lib));
    }

    Ok(libraries)
}

/// Copies a plugin-owned string and hands it back to the plugin's allocator.
///
/// # Safety
/// `ptr` must be null or a NUL-terminated string allocated by the plugin.
unsafe fn take_string(ptr: *mut c_char, free: FreeFn) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let text = CStr::from_ptr(ptr).to_string_lossy().into_owned();
    free(ptr);
    text
}

fn decode_result(text: String) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl PluginModule for DylibModule {
    fn has_hook(&self, hook: Hook) -> bool {
        self.hooks.contains_key(&hook)
    }

    async fn run_hook(&self, hook: Hook) -> Result<(), String> {
        let Some(&hook_fn) = self.hooks.get(&hook) else {
            return Ok(());
        };
        let free = self.free;
        let lib = self.lib.clone();

        tokio::task::spawn_blocking(move || {
            let _lib = lib;
            let mut out: *mut c_char = ptr::null_mut();
            // SAFETY: hook_fn comes from the library kept alive by `_lib`.
            let status = unsafe { hook_fn(&mut out) };
            // SAFETY: `out` was produced by the plugin per the ABI.
            let message = unsafe { take_string(out, free) };
            if status == 0 {
                Ok(())
            } else {
                Err(message)
            }
        })
        .await
        .map_err(|e| format!("{} panicked: {}", hook.name(), e))?
    }

    async fn call(&self, method: &str, args: CallArgs) -> Result<Value, String> {
        let method = CString::new(method).map_err(|e| e.to_string())?;
        let args = serde_json::to_string(&args.into_value()).map_err(|e| e.to_string())?;
        let args = CString::new(args).map_err(|e| e.to_string())?;
        let call = self.call;
        let free = self.free;
        let lib = self.lib.clone();

        // Plugin code may block; keep it off the runtime threads
        tokio::task::spawn_blocking(move || {
            let _lib = lib;
            let mut out: *mut c_char = ptr::null_mut();
            // SAFETY: both strings outlive the call and `call` belongs to `_lib`.
            let status = unsafe { call(method.as_ptr(), args.as_ptr(), &mut out) };
            // SAFETY: `out` was produced by the plugin per the ABI.
            let text = unsafe { take_string(out, free) };
            if status == 0 {
                Ok(decode_result(text))
            } else if text.is_empty() {
                Err(format!("method failed with status {status}"))
            } else {
                Err(text)
            }
        })
        .await
        .map_err(|e| format!("plugin call panicked: {e}"))?
    }
}
