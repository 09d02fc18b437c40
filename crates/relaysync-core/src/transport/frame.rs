//! JSON array frames exchanged with a relay

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TransportError;

/// Range filter carried by a REQ frame (bounds inclusive, unix seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub since: u64,
    pub until: u64,
    pub limit: usize,
}

/// Frames the engine sends
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Req { sub_id: String, filter: Filter },
    Close { sub_id: String },
}

impl ClientFrame {
    pub fn encode(&self) -> String {
        match self {
            ClientFrame::Req { sub_id, filter } => json!(["REQ", sub_id, filter]).to_string(),
            ClientFrame::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
        }
    }

    pub fn decode(line: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| TransportError::Protocol(format!("not json: {}", e)))?;
        let parts = value
            .as_array()
            .ok_or_else(|| TransportError::Protocol("frame is not an array".into()))?;
        match (label(parts)?, parts.len()) {
            ("REQ", 3) => {
                let filter: Filter = serde_json::from_value(parts[2].clone())
                    .map_err(|e| TransportError::Protocol(format!("bad filter: {}", e)))?;
                Ok(ClientFrame::Req {
                    sub_id: text(&parts[1])?,
                    filter,
                })
            }
            ("CLOSE", 2) => Ok(ClientFrame::Close {
                sub_id: text(&parts[1])?,
            }),
            (other, n) => Err(TransportError::Protocol(format!(
                "unexpected client frame {} with {} parts",
                other, n
            ))),
        }
    }
}

/// Frames a relay sends
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event { sub_id: String, event: Value },
    Eose { sub_id: String },
    Closed { sub_id: String, reason: String },
    Notice(String),
}

impl RelayFrame {
    pub fn decode(line: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| TransportError::Protocol(format!("not json: {}", e)))?;
        let parts = value
            .as_array()
            .ok_or_else(|| TransportError::Protocol("frame is not an array".into()))?;
        match (label(parts)?, parts.len()) {
            ("EVENT", 3) => Ok(RelayFrame::Event {
                sub_id: text(&parts[1])?,
                event: parts[2].clone(),
            }),
            ("EOSE", 2) => Ok(RelayFrame::Eose {
                sub_id: text(&parts[1])?,
            }),
            ("CLOSED", n) if n >= 2 => Ok(RelayFrame::Closed {
                sub_id: text(&parts[1])?,
                reason: parts.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
            }),
            ("NOTICE", 2) => Ok(RelayFrame::Notice(text(&parts[1])?)),
            (other, n) => Err(TransportError::Protocol(format!(
                "unexpected relay frame {} with {} parts",
                other, n
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            RelayFrame::Event { sub_id, event } => json!(["EVENT", sub_id, event]).to_string(),
            RelayFrame::Eose { sub_id } => json!(["EOSE", sub_id]).to_string(),
            RelayFrame::Closed { sub_id, reason } => json!(["CLOSED", sub_id, reason]).to_string(),
            RelayFrame::Notice(msg) => json!(["NOTICE", msg]).to_string(),
        }
    }
}

fn label(parts: &[Value]) -> Result<&str, TransportError> {
    parts
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::Protocol("frame has no label".into()))
}

fn text(value: &Value) -> Result<String, TransportError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| TransportError::Protocol("expected string".into()))
}
