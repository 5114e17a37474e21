//! Session domain entities and value objects.

use crate::event::ExitInfo;
use crate::tool::ToolKind;
use crate::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a bridged session.
///
/// Wraps a UUID v4 string (e.g., "8e11bfb5-7dc2-432b-9206-928fa5c35731").
/// Generated by the registry when a session is created; opaque to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a SessionId from an existing string.
    ///
    /// Note: This does not validate UUID format. Identifiers arriving from
    /// clients are only ever used as lookup keys.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random session identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of the principal used when a request names no device.
pub const DEFAULT_PRINCIPAL: &str = "default";

/// Maximum length of a principal name.
const MAX_PRINCIPAL_LEN: usize = 128;

/// Identity derived from authentication; owns sessions.
///
/// A principal is the device name a client presents alongside a valid
/// API key. Names are restricted to `[A-Za-z0-9._-]` so they can appear
/// in logs and paths without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    /// Parses and validates a principal name.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidFieldValue` for empty, overlong, or
    /// non-conforming names.
    pub fn parse(name: &str) -> DomainResult<Self> {
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

        if name.is_empty() || name.len() > MAX_PRINCIPAL_LEN || !valid_chars {
            return Err(DomainError::InvalidFieldValue {
                field: "principal".to_string(),
                value: name.to_string(),
                expected: format!("1-{MAX_PRINCIPAL_LEN} characters of [A-Za-z0-9._-]"),
            });
        }

        Ok(Self(name.to_string()))
    }

    /// The principal used when a request does not name a device.
    #[must_use]
    pub fn default_principal() -> Self {
        Self(DEFAULT_PRINCIPAL.to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Principal {
    fn default() -> Self {
        Self::default_principal()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one attachment of a consumer to a session.
///
/// A fresh id is issued on every successful attach so that a late
/// detach from a previous connection cannot release a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, tool-specific handle that lets a CLI resume a prior conversation.
///
/// The bridge never interprets this value; it is handed to the tool's
/// launch template unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a session.
///
/// ```text
/// Running ──process exits──▶ Exited
///    │
///    └──terminate / idle──▶ Terminated
/// ```
///
/// `Exited` and `Terminated` are terminal: no further input is accepted,
/// but the retained events remain replayable until the session is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The CLI process is alive and accepting input.
    #[default]
    Running,

    /// The CLI process ended on its own.
    Exited,

    /// The session was terminated explicitly or by idle eviction.
    Terminated,
}

impl SessionState {
    /// Returns the display label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Terminated => "terminated",
        }
    }

    /// Returns true if no further input can be delivered.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// Canonical registry-side description of a session.
///
/// Owned by the registry actor; the process handle and event log that
/// accompany it live alongside it in the registry, not in here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Unique identifier
    pub id: SessionId,

    /// Principal that created and owns the session
    pub principal: Principal,

    /// CLI tool running in this session
    pub tool: ToolKind,

    /// Lifecycle state
    pub state: SessionState,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// Last time a client interacted with the session
    pub last_active_at: DateTime<Utc>,

    /// Conversation handle passed to (or assigned by) the tool
    pub continuation: Option<ContinuationToken>,

    /// OS process id of the CLI process
    pub pid: Option<u32>,

    /// Working directory the tool was launched in
    pub workspace: Option<PathBuf>,

    /// Exit status once the process has ended
    pub exit: Option<ExitInfo>,
}

impl SessionRecord {
    /// Creates a running session record with a freshly generated id.
    pub fn new(principal: Principal, tool: ToolKind) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            principal,
            tool,
            state: SessionState::Running,
            created_at: now,
            last_active_at: now,
            continuation: None,
            pid: None,
            workspace: None,
            exit: None,
        }
    }

    /// Refreshes the activity timestamp.
    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    /// Returns true if the given principal owns this session.
    #[must_use]
    pub fn is_owned_by(&self, principal: &Principal) -> bool {
        &self.principal == principal
    }

    /// Returns how long the session has been without client activity.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_active_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns true if the session has been idle longer than `timeout`.
    #[must_use]
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.idle_for(now) > timeout
    }

    /// Records that the process ended on its own.
    ///
    /// A terminated session keeps its `Terminated` state; only the exit
    /// status is recorded.
    pub fn mark_exited(&mut self, exit: ExitInfo) {
        self.exit = Some(exit);
        if self.state == SessionState::Running {
            debug!(session_id = %self.id, exit = %exit, "Session process exited");
            self.state = SessionState::Exited;
        }
    }

    /// Marks the session as terminated. Returns false if it was already terminal.
    pub fn mark_terminated(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Terminated;
        true
    }
}

// ============================================================================
// Session View
// ============================================================================

/// Read-only snapshot of a session for API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    /// Session identifier
    pub id: SessionId,

    /// Tool tag (e.g. "claude")
    pub tool: String,

    /// Lifecycle state
    pub state: SessionState,

    /// Owning principal
    pub principal: Principal,

    /// Continuation token, if known
    pub continuation_token: Option<ContinuationToken>,

    /// OS process id
    pub pid: Option<u32>,

    /// Exit code once the process has ended
    pub exit_code: Option<i32>,

    /// Whether a consumer is currently attached
    pub attached: bool,

    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl SessionView {
    /// Creates a view from a record.
    #[must_use]
    pub fn from_record(record: &SessionRecord, attached: bool) -> Self {
        Self {
            id: record.id.clone(),
            tool: record.tool.tag().to_string(),
            state: record.state,
            principal: record.principal.clone(),
            continuation_token: record.continuation.clone(),
            pid: record.pid,
            exit_code: record.exit.and_then(|e| e.code),
            attached,
            created_at: record.created_at,
            last_active_at: record.last_active_at,
        }
    }
}
