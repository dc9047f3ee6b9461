//! Local socket channel between the supervisor and a sandboxed plugin.
//!
//! The sandbox serves a Unix domain socket; the supervisor holds the single
//! client connection, opened lazily on first use. Both directions carry
//! newline-terminated JSON frames (see [`protocol`]).

pub mod local_socket;
pub mod protocol;

pub use local_socket::{LocalSocket, MessageHandler, BUFFER_LIMIT};
pub use protocol::{
    CallFrame, ControlFrame, EventFrame, ResponseFrame, SocketFrame, SocketMessageType,
};
