//! clibridge Protocol - Wire protocol for the bridge's HTTP surface
//!
//! This crate provides the request/response bodies, event-stream framing
//! and client-input parsing shared by the daemon and its clients.

pub mod message;
pub mod parse;
pub mod version;

pub use message::{
    CertificateResponse, CreateSessionRequest, CreateSessionResponse, ErrorResponse, GapNotice,
    GlobalEvent, HealthResponse, HeartbeatNotice, InputAccepted, InputRequest, ReloadResponse,
    SessionListResponse, WireEvent,
};
pub use parse::{
    parse_last_event_id, parse_tool, ProtocolError, StreamFrame, GAP_EVENT, LAST_EVENT_ID_HEADER,
    LAST_EVENT_ID_QUERY,
};
pub use version::{ProtocolVersion, VersionError, PROTOCOL_HEADER};
