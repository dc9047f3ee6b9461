//! Backend compiled to a cdylib by `tests/dylib_test.rs`.
//!
//! `echo` returns its arguments and emits them as an `echoed` event, `fail`
//! reports an error, the main hook never returns and the shutdown hooks leave
//! marker files in the plugin's runtime directory.

use std::ffi::{c_char, CStr, CString};
use std::sync::OnceLock;
use std::time::Duration;

type Emit = extern "C" fn(*const c_char, *const c_char);

static EMIT: OnceLock<Emit> = OnceLock::new();

unsafe fn hand_out(out: *mut *mut c_char, text: &str) {
    if let Ok(text) = CString::new(text) {
        *out = text.into_raw();
    }
}

fn mark(name: &str) -> i32 {
    match std::env::var("DECKY_PLUGIN_RUNTIME_DIR") {
        Ok(dir) if std::fs::write(format!("{dir}/{name}"), name).is_ok() => 0,
        _ => 1,
    }
}

#[no_mangle]
pub extern "C" fn decky_plugin_init(emit: Emit) -> i32 {
    let _ = EMIT.set(emit);
    0
}

#[no_mangle]
pub unsafe extern "C" fn decky_plugin_call(
    method: *const c_char,
    args: *const c_char,
    out: *mut *mut c_char,
) -> i32 {
    let method = CStr::from_ptr(method).to_string_lossy().into_owned();
    match method.as_str() {
        "echo" => {
            if let Some(emit) = EMIT.get() {
                emit(b"echoed\0".as_ptr().cast(), args);
            }
            let args = CStr::from_ptr(args).to_string_lossy().into_owned();
            hand_out(out, &args);
            0
        }
        "fail" => {
            hand_out(out, "nope");
            1
        }
        other => {
            hand_out(out, &format!("no method {other}"));
            1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn decky_plugin_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

#[no_mangle]
pub extern "C" fn decky_plugin_main(_out: *mut *mut c_char) -> i32 {
    loop {
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[no_mangle]
pub extern "C" fn decky_plugin_unload(_out: *mut *mut c_char) -> i32 {
    mark("unloaded")
}

#[no_mangle]
pub extern "C" fn decky_plugin_uninstall(_out: *mut *mut c_char) -> i32 {
    mark("uninstalled")
}
