//! Line-delimited JSON frames exchanged between the supervisor and a sandbox.
//!
//! Every frame is a single JSON object terminated by `\n`. Calls, responses and
//! events carry an integer `type`; the control frame has no type and is
//! recognised by its `uninstall` key.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SocketMessageType {
    Call,
    Response,
    Event,
}

impl From<SocketMessageType> for u8 {
    fn from(kind: SocketMessageType) -> u8 {
        match kind {
            SocketMessageType::Call => 0,
            SocketMessageType::Response => 1,
            SocketMessageType::Event => 2,
        }
    }
}

impl TryFrom<u8> for SocketMessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SocketMessageType::Call),
            1 => Ok(SocketMessageType::Response),
            2 => Ok(SocketMessageType::Event),
            other => Err(format!("unknown socket message type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub kind: SocketMessageType,
    pub method: String,
    /// Positional array, or a keyword object when `legacy` is set
    pub args: Value,
    pub id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub kind: SocketMessageType,
    pub id: String,
    pub success: bool,
    pub res: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub kind: SocketMessageType,
    pub event: String,
    pub args: Value,
}

/// Out-of-band frame written by `stop`; it never gets a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(default)]
    pub stop: bool,
    pub uninstall: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    Call(CallFrame),
    Response(ResponseFrame),
    Event(EventFrame),
    Control(ControlFrame),
}

impl CallFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, args: Value) -> Self {
        Self {
            kind: SocketMessageType::Call,
            method: method.into(),
            args,
            id: id.into(),
            legacy: false,
        }
    }

    pub fn legacy(id: impl Into<String>, method: impl Into<String>, kwargs: Value) -> Self {
        Self {
            legacy: true,
            ..Self::new(id, method, kwargs)
        }
    }
}

impl ResponseFrame {
    pub fn success(id: impl Into<String>, res: Value) -> Self {
        Self {
            kind: SocketMessageType::Response,
            id: id.into(),
            success: true,
            res,
        }
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: SocketMessageType::Response,
            id: id.into(),
            success: false,
            res: Value::String(message.into()),
        }
    }
}

impl EventFrame {
    pub fn new(event: impl Into<String>, args: Value) -> Self {
        Self {
            kind: SocketMessageType::Event,
            event: event.into(),
            args,
        }
    }
}

impl ControlFrame {
    pub fn stop(uninstall: bool) -> Self {
        Self {
            stop: true,
            uninstall,
        }
    }
}

impl SocketFrame {
    pub fn decode(line: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| TransportError::InvalidFormat("frame is not an object".into()))?;

        if object.contains_key("uninstall") {
            return serde_json::from_value(value)
                .map(SocketFrame::Control)
                .map_err(|e| TransportError::InvalidFormat(e.to_string()));
        }

        let kind = object
            .get("type")
            .and_then(Value::as_u64)
            .and_then(|t| u8::try_from(t).ok())
            .ok_or_else(|| TransportError::InvalidFormat("missing frame type".into()))
            .and_then(|t| {
                SocketMessageType::try_from(t).map_err(TransportError::InvalidFormat)
            })?;

        let frame = match kind {
            SocketMessageType::Call => serde_json::from_value(value).map(SocketFrame::Call),
            SocketMessageType::Response => {
                serde_json::from_value(value).map(SocketFrame::Response)
            }
            SocketMessageType::Event => serde_json::from_value(value).map(SocketFrame::Event),
        };

        frame.map_err(|e| TransportError::InvalidFormat(e.to_string()))
    }

    pub fn encode(&self) -> String {
        let encoded = match self {
            SocketFrame::Call(frame) => serde_json::to_string(frame),
            SocketFrame::Response(frame) => serde_json::to_string(frame),
            SocketFrame::Event(frame) => serde_json::to_string(frame),
            SocketFrame::Control(frame) => serde_json::to_string(frame),
        };
        // Frames are built from owned JSON values and string keys only
        encoded.unwrap_or_default()
    }
}

impl From<CallFrame> for SocketFrame {
    fn from(frame: CallFrame) -> Self {
        SocketFrame::Call(frame)
    }
}

impl From<ResponseFrame> for SocketFrame {
    fn from(frame: ResponseFrame) -> Self {
        SocketFrame::Response(frame)
    }
}

impl From<EventFrame> for SocketFrame {
    fn from(frame: EventFrame) -> Self {
        SocketFrame::Event(frame)
    }
}

impl From<ControlFrame> for SocketFrame {
    fn from(frame: ControlFrame) -> Self {
        SocketFrame::Control(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_frame_wire_shape() {
        let frame = SocketFrame::from(CallFrame::new("abc", "greet", json!(["world"])));
        let wire: Value = serde_json::from_str(&frame.encode()).unwrap();

        assert_eq!(
            wire,
            json!({"type": 0, "method": "greet", "args": ["world"], "id": "abc"})
        );
    }

    #[test]
    fn test_legacy_call_carries_marker() {
        let frame = SocketFrame::from(CallFrame::legacy("1", "get", json!({"key": "v"})));
        let wire: Value = serde_json::from_str(&frame.encode()).unwrap();

        assert_eq!(wire["legacy"], json!(true));
        assert_eq!(wire["args"], json!({"key": "v"}));
    }

    #[test]
    fn test_decode_response_and_event() {
        let frame =
            SocketFrame::decode(r#"{"type":1,"id":"x","success":false,"res":"bad"}"#).unwrap();
        assert_eq!(frame, SocketFrame::Response(ResponseFrame::failure("x", "bad")));

        let frame = SocketFrame::decode("{\"type\":2,\"event\":\"tick\",\"args\":[1]}\n").unwrap();
        assert_eq!(frame, SocketFrame::Event(EventFrame::new("tick", json!([1]))));
    }

    #[test]
    fn test_uninstall_key_marks_control_frame() {
        let frame = SocketFrame::decode(r#"{"stop":true,"uninstall":true}"#).unwrap();
        assert_eq!(frame, SocketFrame::Control(ControlFrame::stop(true)));

        let frame = SocketFrame::decode(r#"{"uninstall":false}"#).unwrap();
        assert_eq!(
            frame,
            SocketFrame::Control(ControlFrame {
                stop: false,
                uninstall: false
            })
        );
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(SocketFrame::decode("").is_err());
        assert!(SocketFrame::decode("[1,2]").is_err());
        assert!(SocketFrame::decode(r#"{"type":9}"#).is_err());
        assert!(SocketFrame::decode(r#"{"type":1,"id":"x"}"#).is_err());
    }
}
