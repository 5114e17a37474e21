//! Request, response and stream payload types for the HTTP surface.

use crate::version::ProtocolVersion;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use clibridge_core::{
    ContinuationToken, Event, EventKind, SessionId, SessionState, SessionView,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Session Requests and Responses
// ============================================================================

/// Body of `POST /session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Tool tag, e.g. "claude" or "echo-cli"
    pub tool: String,

    /// Continuation token from an earlier session of the same tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,

    /// Existing bridge session to resume instead of spawning a new one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Working directory for the tool (must lie under a trusted root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

/// Body returned by `POST /session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub tool: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<ContinuationToken>,
    pub created_at: DateTime<Utc>,
    /// True when an existing session was returned rather than created
    pub resumed: bool,
}

impl CreateSessionResponse {
    /// Builds a response from a session view.
    pub fn from_view(view: SessionView, resumed: bool) -> Self {
        Self {
            session_id: view.id,
            tool: view.tool,
            state: view.state,
            continuation_token: view.continuation_token,
            created_at: view.created_at,
            resumed,
        }
    }
}

/// Body of `POST /session/{id}/input`.
///
/// Exactly one field must be set:
/// - `line`: UTF-8 text, a trailing newline is added when missing
/// - `text`: UTF-8 text delivered verbatim
/// - `data_b64`: arbitrary bytes, standard base64
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
}

impl InputRequest {
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            line: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn bytes(data: &[u8]) -> Self {
        Self {
            data_b64: Some(BASE64.encode(data)),
            ..Default::default()
        }
    }
}

/// Body returned by `POST /session/{id}/input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAccepted {
    pub bytes: usize,
}

/// Body returned by `GET /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionView>,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. "session_not_found"
    pub error: String,
    /// Human-readable description
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// Body returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol_version: ProtocolVersion,
    pub uptime_secs: u64,
}

// ============================================================================
// Certificate Responses
// ============================================================================

/// Body returned by `GET /certificate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateResponse {
    /// `SHA256:` followed by colon-separated upper-case hex
    pub fingerprint: String,
    /// "self_signed" or "external"
    pub provenance: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_alt_names: Vec<String>,
    /// True when external material was expected but self-signed is served
    pub fallback: bool,
    pub reloads: u64,
}

/// Body returned by `POST /certificate/reload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub previous_fingerprint: Option<String>,
    pub fingerprint: String,
    pub changed: bool,
}

// ============================================================================
// Stream Payloads
// ============================================================================

/// JSON payload of one stored event on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: u64,
    pub kind: EventKind,
    /// Raw bytes (OUTPUT / ERROR), standard base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
    /// The same bytes decoded as UTF-8, when they are valid UTF-8
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl WireEvent {
    /// Converts a stored event into its wire form.
    pub fn from_event(event: &Event) -> Self {
        let bytes = event.payload.bytes();
        let has_data = matches!(event.kind, EventKind::Output | EventKind::Error);
        let exit = event.exit_info();

        Self {
            id: event.id,
            kind: event.kind,
            data_b64: has_data.then(|| BASE64.encode(bytes)),
            text: has_data
                .then(|| std::str::from_utf8(bytes).ok().map(str::to_string))
                .flatten(),
            exit_code: exit.and_then(|e| e.code),
            signal: exit.and_then(|e| e.signal),
            timestamp: event.timestamp,
        }
    }

    /// Decodes the raw bytes carried by this event.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.data_b64
            .as_deref()
            .and_then(|b64| BASE64.decode(b64).ok())
    }
}

/// Payload of a `gap` frame: history between the two ids was evicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapNotice {
    pub requested_after: u64,
    pub first_available: u64,
}

/// Payload of a `heartbeat` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatNotice {
    pub timestamp: DateTime<Utc>,
}

/// Events delivered on the global `GET /events` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlobalEvent {
    /// The served certificate changed; clients should re-pin.
    CertificateChanged {
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_fingerprint: Option<String>,
        fingerprint: String,
        provenance: String,
    },

    /// A session owned by the subscriber changed state.
    SessionStateChanged {
        session_id: SessionId,
        state: SessionState,
    },

    /// A session owned by the subscriber was removed.
    SessionRemoved { session_id: SessionId, reason: String },
}

impl GlobalEvent {
    /// SSE event name, also the key used for rate limiting.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CertificateChanged { .. } => "certificate_changed",
            Self::SessionStateChanged { .. } => "session_state_changed",
            Self::SessionRemoved { .. } => "session_removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clibridge_core::{EventLog, ExitInfo};

    #[test]
    fn test_wire_event_output() {
        let mut log = EventLog::new(4);
        log.append_output(b"pong\n".to_vec());
        let event = log.range_from(0).into_events().remove(0);

        let wire = WireEvent::from_event(&event);
        assert_eq!(wire.id, 1);
        assert_eq!(wire.kind, EventKind::Output);
        assert_eq!(wire.text.as_deref(), Some("pong\n"));
        assert_eq!(wire.data().unwrap(), b"pong\n");
        assert_eq!(wire.exit_code, None);
    }

    #[test]
    fn test_wire_event_binary_has_no_text() {
        let mut log = EventLog::new(4);
        log.append_error(vec![0xff, 0xfe]);
        let event = log.range_from(0).into_events().remove(0);

        let wire = WireEvent::from_event(&event);
        assert_eq!(wire.kind, EventKind::Error);
        assert!(wire.text.is_none());
        assert_eq!(wire.data().unwrap(), vec![0xff, 0xfe]);
    }

    #[test]
    fn test_wire_event_exit_serialization() {
        let mut log = EventLog::new(4);
        log.append_exit(ExitInfo::from_code(7));
        let event = log.range_from(0).into_events().remove(0);

        let json = serde_json::to_value(WireEvent::from_event(&event)).unwrap();
        assert_eq!(json["kind"], "exit");
        assert_eq!(json["exit_code"], 7);
        assert!(json.get("data_b64").is_none());
        assert!(json.get("signal").is_none());
    }

    #[test]
    fn test_create_request_minimal() {
        let req: CreateSessionRequest = serde_json::from_str(r#"{"tool":"claude"}"#).unwrap();
        assert_eq!(req.tool, "claude");
        assert!(req.resume_token.is_none());
        assert!(req.session_id.is_none());
    }

    #[test]
    fn test_global_event_tagging() {
        let event = GlobalEvent::SessionRemoved {
            session_id: SessionId::new("s-1"),
            reason: "idle".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_removed");
        assert_eq!(event.name(), "session_removed");
    }
}
