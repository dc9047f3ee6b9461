//! Turns call frames into plugin method invocations.

use super::module::{CallArgs, PluginModule};
use crate::transport::{CallFrame, ResponseFrame, SocketFrame};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// How a plugin expects its methods to be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// `api_version` 0: methods take keyword arguments and a receiver
    Legacy,
    /// `api_version` 1 and later: methods take positional arguments
    Bound,
}

impl Convention {
    pub fn for_api_version(api_version: u32) -> Self {
        if api_version >= 1 {
            Convention::Bound
        } else {
            Convention::Legacy
        }
    }

    /// Shapes call arguments, rejecting frames meant for the other convention.
    pub fn adapt(&self, frame: &CallFrame) -> Result<CallArgs, String> {
        match (self, frame.legacy) {
            (Convention::Legacy, true) => match &frame.args {
                Value::Object(kwargs) => Ok(CallArgs::Keyword(kwargs.clone())),
                Value::Null => Ok(CallArgs::Keyword(Map::new())),
                other => Err(format!("Legacy call arguments must be an object, got {other}")),
            },
            (Convention::Bound, false) => match &frame.args {
                Value::Array(args) => Ok(CallArgs::Positional(args.clone())),
                Value::Null => Ok(CallArgs::Positional(Vec::new())),
                other => Err(format!("Call arguments must be an array, got {other}")),
            },
            (Convention::Bound, true) => Err(format!(
                "Method {} cannot be called with the legacy convention",
                frame.method
            )),
            (Convention::Legacy, false) => Err(format!(
                "Method {} belongs to a legacy plugin and must be called with keyword arguments",
                frame.method
            )),
        }
    }
}

/// Answers frames arriving on the sandbox socket.
#[derive(Clone)]
pub struct Dispatcher {
    module: Arc<dyn PluginModule>,
    convention: Convention,
    uninstalling: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(module: Arc<dyn PluginModule>, api_version: u32) -> Self {
        Self {
            module,
            convention: Convention::for_api_version(api_version),
            uninstalling: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    /// Whether the last control frame asked for an uninstall.
    pub fn uninstalling(&self) -> bool {
        self.uninstalling.load(Ordering::SeqCst)
    }

    /// Handles one line; returns the response frame to write back, if any.
    pub async fn on_message(&self, line: String) -> Option<String> {
        let frame = match SocketFrame::decode(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Discarding malformed frame");
                return None;
            }
        };

        match frame {
            SocketFrame::Control(control) => {
                debug!(stop = control.stop, uninstall = control.uninstall, "Control frame");
                self.uninstalling.store(control.uninstall, Ordering::SeqCst);
                None
            }
            SocketFrame::Call(call) => {
                let response = self.dispatch(call).await;
                Some(SocketFrame::from(response).encode())
            }
            other => {
                debug!(frame = ?other, "Ignoring unexpected frame");
                None
            }
        }
    }

    async fn dispatch(&self, call: CallFrame) -> ResponseFrame {
        let result = match self.convention.adapt(&call) {
            Ok(args) => self.module.call(&call.method, args).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(res) => ResponseFrame::success(call.id, res),
            Err(message) => {
                debug!(method = %call.method, error = %message, "Plugin method failed");
                ResponseFrame::failure(call.id, message)
            }
        }
    }
}
