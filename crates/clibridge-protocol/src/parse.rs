//! Parsing of client-supplied values and event-stream framing.
//!
//! Requests arrive as loosely-typed JSON and headers; the helpers here turn
//! them into validated domain values. Stream frames go the other way: a
//! [`StreamFrame`] is the transport-independent form of one Server-Sent
//! Event, rendered by the gateway.

use crate::message::{GapNotice, HeartbeatNotice, InputRequest, WireEvent};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use clibridge_core::{DomainError, Event, EventKind, ToolKind};
use thiserror::Error;

/// Header a reconnecting event-stream client uses to resume.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Query parameter accepted as a fallback for [`LAST_EVENT_ID_HEADER`].
pub const LAST_EVENT_ID_QUERY: &str = "last_event_id";

/// SSE event name for evicted history.
pub const GAP_EVENT: &str = "gap";

/// Errors produced while interpreting client input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid Last-Event-ID: {0:?}")]
    InvalidLastEventId(String),

    #[error("input must set exactly one of line, text, data_b64")]
    AmbiguousInput,

    #[error("invalid base64 input: {0}")]
    InvalidBase64(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

// ============================================================================
// Request Parsing
// ============================================================================

/// Parses the tool tag of a create request.
///
/// # Errors
///
/// `ProtocolError::Domain(UnknownTool)` for tags outside the supported set.
pub fn parse_tool(tag: &str) -> Result<ToolKind, ProtocolError> {
    Ok(tag.trim().parse::<ToolKind>()?)
}

/// Determines the resume position of an event-stream request.
///
/// The `Last-Event-ID` header wins over the query parameter. A missing or
/// empty value means "from the beginning" (0).
///
/// # Errors
///
/// `ProtocolError::InvalidLastEventId` if the chosen value is not a
/// non-negative integer.
pub fn parse_last_event_id(header: Option<&str>, query: Option<&str>) -> Result<u64, ProtocolError> {
    let raw = header
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| query.map(str::trim).filter(|v| !v.is_empty()));

    match raw {
        None => Ok(0),
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidLastEventId(value.to_string())),
    }
}

impl InputRequest {
    /// Decodes the request into the bytes written to the process stdin.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::AmbiguousInput` unless exactly one field is set
    /// - `ProtocolError::InvalidBase64` for undecodable `data_b64`
    pub fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        match (self.line, self.text, self.data_b64) {
            (Some(line), None, None) => {
                let mut bytes = line.into_bytes();
                if bytes.last() != Some(&b'\n') {
                    bytes.push(b'\n');
                }
                Ok(bytes)
            }
            (None, Some(text), None) => Ok(text.into_bytes()),
            (None, None, Some(b64)) => BASE64
                .decode(b64.trim())
                .map_err(|e| ProtocolError::InvalidBase64(e.to_string())),
            _ => Err(ProtocolError::AmbiguousInput),
        }
    }
}

// ============================================================================
// Stream Framing
// ============================================================================

/// One Server-Sent Event, independent of the HTTP framework.
///
/// Stored events carry their sequence id so a client can resume with
/// `Last-Event-ID`; gap and heartbeat frames carry no id and therefore do
/// not move the client's resume position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub id: Option<u64>,
    pub event: &'static str,
    pub data: String,
}

impl StreamFrame {
    /// Frame for a stored event (or a heartbeat event with id 0).
    pub fn from_event(event: &Event) -> Self {
        if event.kind == EventKind::Heartbeat {
            return Self::heartbeat();
        }

        Self {
            id: Some(event.id),
            event: event.kind.as_str(),
            data: to_json(&WireEvent::from_event(event)),
        }
    }

    /// Frame telling the client that history was lost.
    pub fn gap(requested_after: u64, first_available: u64) -> Self {
        Self {
            id: None,
            event: GAP_EVENT,
            data: to_json(&GapNotice {
                requested_after,
                first_available,
            }),
        }
    }

    /// Keep-alive frame.
    pub fn heartbeat() -> Self {
        Self {
            id: None,
            event: EventKind::Heartbeat.as_str(),
            data: to_json(&HeartbeatNotice {
                timestamp: Utc::now(),
            }),
        }
    }

    /// Renders the frame in `text/event-stream` format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(id) = self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        out.push_str(&format!("event: {}\n", self.event));
        out.push_str(&format!("data: {}\n\n", self.data));
        out
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    // Serializing these plain structs cannot fail; fall back to an empty object.
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}
