//! Bookkeeping for calls awaiting a response from a sandbox.

use crate::error::PluginError;
use crate::transport::ResponseFrame;
use serde_json::Value;
use tokio::sync::oneshot;

type Outcome = Result<Value, PluginError>;

/// Registered half of an outstanding call, resolved by the response listener.
pub struct PendingCall {
    pub id: String,
    sender: oneshot::Sender<Outcome>,
}

/// Caller half of an outstanding call.
pub struct CallWaiter {
    plugin: String,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingCall {
    pub fn new(plugin: &str) -> (Self, CallWaiter) {
        let (sender, receiver) = oneshot::channel();
        let call = Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
        };
        let waiter = CallWaiter {
            plugin: plugin.to_string(),
            receiver,
        };
        (call, waiter)
    }

    pub fn resolve(self, response: ResponseFrame) {
        let outcome = if response.success {
            Ok(response.res)
        } else {
            Err(PluginError::MethodFailed(error_text(response.res)))
        };
        // The caller may have given up waiting; nothing to deliver then
        let _ = self.sender.send(outcome);
    }

    pub fn abandon(self, plugin: &str) {
        let _ = self.sender.send(Err(PluginError::Stopped(plugin.to_string())));
    }
}

impl CallWaiter {
    pub async fn wait(self) -> Result<Value, PluginError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PluginError::Stopped(self.plugin)),
        }
    }
}

fn error_text(res: Value) -> String {
    match res {
        Value::String(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_success_and_failure() {
        let (call, waiter) = PendingCall::new("demo");
        let id = call.id.clone();
        call.resolve(ResponseFrame::success(id, json!({"ok": true})));
        assert_eq!(waiter.wait().await.unwrap(), json!({"ok": true}));

        let (call, waiter) = PendingCall::new("demo");
        let id = call.id.clone();
        call.resolve(ResponseFrame::failure(id, "bad"));
        let err = waiter.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "bad");
    }

    #[tokio::test]
    async fn test_abandoned_call_reports_stop() {
        let (call, waiter) = PendingCall::new("demo");
        call.abandon("demo");
        assert!(matches!(waiter.wait().await, Err(PluginError::Stopped(_))));

        let (call, waiter) = PendingCall::new("demo");
        drop(call);
        assert!(matches!(waiter.wait().await, Err(PluginError::Stopped(_))));
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _) = PendingCall::new("demo");
        let (b, _) = PendingCall::new("demo");
        assert_ne!(a.id, b.id);
    }
}
