//! clibridge Core - Shared domain types for the session bridge
//!
//! This crate provides the domain types shared between the daemon
//! (clibridged) and the wire protocol (clibridge-protocol):
//! - `session` - session identity, ownership and lifecycle state
//! - `event` - the per-session bounded, replayable event log
//! - `tool` - the closed set of supported CLI tools and their launch templates
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod event;
pub mod session;
pub mod tool;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use event::{Event, EventKind, EventLog, EventPayload, ExitInfo, Replay, DEFAULT_EVENT_LOG_CAPACITY};
pub use session::{
    ConsumerId, ContinuationToken, Principal, SessionId, SessionRecord, SessionState, SessionView,
    DEFAULT_PRINCIPAL,
};
pub use tool::{LaunchSpec, ToolKind, ToolLaunch, ToolOverrides, SCRUBBED_ENV_VARS};
