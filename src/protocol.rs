//! JSON messages exchanged over the terminal WebSocket.
//!
//! Every frame is an envelope `{"type": ..., "data": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::ExitCode;

pub const ERR_NOT_INITIALIZED: &str = "Session not initialized";
pub const ERR_UNKNOWN_TYPE: &str = "Unknown message type";
pub const ERR_MALFORMED: &str = "Failed to process message";
pub const ERR_INIT_FAILED: &str = "Failed to initialize session";

/// Messages sent by the browser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Init {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Command {
        command: String,
    },
    Resize {
        cols: u32,
        rows: u32,
    },
}

/// Messages sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {},
    Output {
        output: String,
        #[serde(rename = "exitCode")]
        exit_code: ExitCode,
    },
    Error(String),
    Prompt {
        user: String,
        hostname: String,
        directory: String,
    },
    ResizeAck {
        cols: u32,
        rows: u32,
    },
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Well-formed envelope with a `type` this server does not handle.
    UnknownType(String),
    /// Not JSON, no envelope, or bad `data` for a known type.
    Malformed,
}

impl DecodeError {
    /// Text of the `error` reply for this failure.
    pub fn reply(&self) -> &'static str {
        match self {
            DecodeError::UnknownType(_) => ERR_UNKNOWN_TYPE,
            DecodeError::Malformed => ERR_MALFORMED,
        }
    }
}

const KNOWN_TYPES: &[&str] = &["init", "command", "resize"];

/// Parse one text frame.
pub fn decode(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|_| DecodeError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::Malformed)?;
    if !KNOWN_TYPES.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|_| DecodeError::Malformed)
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(message.into())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
