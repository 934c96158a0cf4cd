//! JSON control messages carried in WebSocket text frames.
//!
//! Terminal bytes travel as binary frames. Text frames are either plain
//! keyboard input or one of these tagged JSON objects.

use serde::{Deserialize, Serialize};

/// A control message exchanged with a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Server -> client: the id of the session the connection is attached to.
    Session { id: String },
    /// Client -> server: the client's terminal was resized.
    Resize { cols: u16, rows: u16 },
    /// Server -> client: a request could not be honoured.
    Error { message: String },
}

impl ControlMessage {
    /// Try to interpret a text frame as a control message.
    ///
    /// Returns `None` for anything that is not a well-formed control object,
    /// so ordinary typed text falls through as terminal input.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Encode as a JSON string.
    pub fn to_json(&self) -> crate::FlexiResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
