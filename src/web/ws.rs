//! WebSocket RPC between the UI and the host.
//!
//! The UI calls named routes and receives replies, errors and unsolicited
//! events over a single connection. A new connection replaces the previous
//! one; replies computed for a replaced connection are dropped.

use crate::error::{LoaderError, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{Future, FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection};

pub type RouteHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum MessageType {
    Error,
    Call,
    Reply,
    Event,
}

impl From<MessageType> for i8 {
    fn from(kind: MessageType) -> i8 {
        match kind {
            MessageType::Error => -1,
            MessageType::Call => 0,
            MessageType::Reply => 1,
            MessageType::Event => 3,
        }
    }
}

impl TryFrom<i8> for MessageType {
    type Error = String;

    fn try_from(value: i8) -> std::result::Result<Self, String> {
        match value {
            -1 => Ok(MessageType::Error),
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Event),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    route: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
struct ReplyMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
struct ErrorMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    id: Value,
    error: Value,
}

#[derive(Debug, Serialize)]
struct EventMessage<'a> {
    #[serde(rename = "type")]
    kind: MessageType,
    event: &'a str,
    data: Value,
}

struct Session {
    instance_id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub struct WsRouter {
    routes: DashMap<String, RouteHandler>,
    session: Mutex<Option<Session>>,
    instance_id: AtomicU64,
}

impl WsRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |args| handler(args).boxed());
        self.routes.insert(name.into(), handler);
    }

    pub fn remove_route(&self, name: &str) -> bool {
        self.routes.remove(name).is_some()
    }

    pub fn has_route(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Id of the connection currently attached, if any.
    pub async fn current_instance(&self) -> Option<u64> {
        self.session.lock().await.as_ref().map(|s| s.instance_id)
    }

    /// Pushes an event to the attached UI; without one the event is dropped.
    pub async fn emit(&self, event: &str, data: Value) {
        let message = EventMessage {
            kind: MessageType::Event,
            event,
            data,
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(event = %event, error = %e, "Failed to encode event");
                return;
            }
        };

        match self.session.lock().await.as_ref() {
            Some(session) => {
                if session.tx.send(Message::text(text)).is_err() {
                    debug!(event = %event, "UI connection closed, event dropped");
                }
            }
            None => debug!(event = %event, "No UI connection, event dropped"),
        }
    }

    /// Serves one UI connection until it closes or is replaced.
    pub async fn handle(self: Arc<Self>, ws: WebSocket) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let mut rx = UnboundedReceiverStream::new(rx);

        tokio::spawn(async move {
            while let Some(msg) = rx.next().await {
                let closing = msg.is_close();
                if let Err(e) = ws_tx.send(msg).await {
                    debug!(error = %e, "WebSocket send error");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let instance_id = self.instance_id.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self
            .session
            .lock()
            .await
            .replace(Session { instance_id, tx });
        if let Some(previous) = previous {
            debug!(
                previous = previous.instance_id,
                instance_id, "Replacing UI connection"
            );
            let _ = previous.tx.send(Message::close());
        }
        debug!(instance_id, "UI connected");

        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(instance_id, error = %e, "WebSocket error");
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            if self.current_instance().await != Some(instance_id) {
                debug!(instance_id, "Connection was replaced");
                break;
            }
            if let Ok(text) = msg.to_str() {
                self.on_message(text, instance_id).await;
            }
        }

        let mut session = self.session.lock().await;
        if session.as_ref().map(|s| s.instance_id) == Some(instance_id) {
            session.take();
        }
        debug!(instance_id, "UI disconnected");
    }

    async fn on_message(self: &Arc<Self>, text: &str, instance_id: u64) {
        let call: CallMessage = match serde_json::from_str(text) {
            Ok(call) => call,
            Err(e) => {
                warn!(error = %e, "Malformed UI message");
                return;
            }
        };
        if call.kind != MessageType::Call {
            debug!(kind = ?call.kind, "Ignoring non-call UI message");
            return;
        }

        let Some(handler) = self.routes.get(&call.route).map(|h| h.value().clone()) else {
            let err = LoaderError::RouteNotFound(call.route);
            warn!(error = %err, "Unknown route");
            self.write(instance_id, error_message(call.id, Value::String(err.to_string())))
                .await;
            return;
        };

        let router = self.clone();
        tokio::spawn(async move {
            let route = call.route;
            let message = match handler(call.args).await {
                Ok(result) => serde_json::to_string(&ReplyMessage {
                    kind: MessageType::Reply,
                    id: call.id,
                    result,
                }),
                Err(e) => {
                    error!(route = %route, error = %e, "Route failed");
                    Ok(error_message(call.id, error_payload(&e)))
                }
            };

            match message {
                Ok(message) => router.write(instance_id, message).await,
                Err(e) => warn!(route = %route, error = %e, "Failed to encode reply"),
            }
        });
    }

    async fn write(&self, instance_id: u64, text: String) {
        match self.session.lock().await.as_ref() {
            Some(session) if session.instance_id == instance_id => {
                let _ = session.tx.send(Message::text(text));
            }
            _ => debug!(instance_id, "Dropping reply for a replaced connection"),
        }
    }

    /// `GET /ws`, upgraded to a router session.
    pub fn filter(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
        let router = self.clone();
        warp::path("ws")
            .and(warp::path::end())
            .and(warp::ws())
            .map(move |ws: warp::ws::Ws| {
                let router = router.clone();
                ws.on_upgrade(move |socket| router.handle(socket))
            })
    }
}

fn error_message(id: Value, error: Value) -> String {
    let message = ErrorMessage {
        kind: MessageType::Error,
        id,
        error,
    };
    serde_json::to_string(&message).unwrap_or_default()
}

/// `{name, message, traceback}` describing a failed route.
pub fn error_payload(err: &LoaderError) -> Value {
    let mut traceback = Vec::new();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        traceback.push(cause.to_string());
        source = cause.source();
    }

    json!({
        "name": err.kind(),
        "message": err.to_string(),
        "traceback": traceback.join("\n"),
    })
}
