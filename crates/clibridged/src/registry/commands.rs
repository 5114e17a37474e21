//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::path::PathBuf;
use std::sync::Arc;

use clibridge_core::{
    ConsumerId, ContinuationToken, ExitInfo, Principal, SessionId, SessionState, SessionView,
    ToolKind,
};
use thiserror::Error;
use tokio::sync::oneshot;

use super::feed::SessionFeed;
use crate::supervisor::SpawnError;

// ============================================================================
// Registry Commands
// ============================================================================

/// What a successful attach hands back to the caller.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Snapshot of the session at attach time
    pub session: SessionView,
    /// Identifies this attachment for the matching detach
    pub consumer_id: ConsumerId,
    /// The session's event feed
    pub feed: Arc<SessionFeed>,
}

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Spawn a tool process and register a session for it.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at maximum capacity
    /// - `RegistryError::Spawn` if the process could not be started
    Create {
        principal: Principal,
        tool: ToolKind,
        continuation: Option<ContinuationToken>,
        /// Already validated against the workspace policy
        workspace: Option<PathBuf>,
        respond_to: oneshot::Sender<Result<SessionView, RegistryError>>,
    },

    /// Attach the single consumer of a session.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` / `Forbidden`
    /// - `RegistryError::Conflict` if another consumer is attached
    Attach {
        session_id: SessionId,
        principal: Principal,
        respond_to: oneshot::Sender<Result<Attachment, RegistryError>>,
    },

    /// Release an attachment. Stale consumer ids are ignored.
    ///
    /// When `exit_acknowledged` is set and the session is terminal, the
    /// session is removed.
    Detach {
        session_id: SessionId,
        consumer_id: ConsumerId,
        exit_acknowledged: bool,
        respond_to: oneshot::Sender<()>,
    },

    /// Forward bytes to the session's process stdin.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` / `Forbidden`
    /// - `RegistryError::ProcessGone` if the process has exited or was terminated
    Input {
        session_id: SessionId,
        principal: Principal,
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, RegistryError>>,
    },

    /// Terminate a session's process. Idempotent for terminal sessions.
    ///
    /// Responds with the session feed so the caller can wait for EXIT.
    Terminate {
        session_id: SessionId,
        principal: Principal,
        respond_to: oneshot::Sender<Result<Arc<SessionFeed>, RegistryError>>,
    },

    /// Get a single session by ID.
    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionView>>,
    },

    /// List sessions, optionally only those of one principal.
    ListSessions {
        principal: Option<Principal>,
        respond_to: oneshot::Sender<Vec<SessionView>>,
    },

    /// Sent by a session's output pump once EXIT has been recorded.
    ProcessExited { session_id: SessionId, exit: ExitInfo },

    /// Evict idle sessions.
    ///
    /// Fire-and-forget from the periodic sweep task; tests pass a
    /// responder to learn how many sessions were removed.
    Sweep {
        respond_to: Option<oneshot::Sender<usize>>,
    },

    /// Terminate every running session (daemon shutdown).
    ///
    /// Responds with the feeds of the terminated sessions.
    Shutdown {
        respond_to: oneshot::Sender<Vec<Arc<SessionFeed>>>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
///
/// Uses `thiserror` for ergonomic error handling and Display implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull {
        /// Maximum number of sessions allowed
        max: usize,
    },

    /// The requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session belongs to another principal.
    #[error("session {0} belongs to another principal")]
    Forbidden(SessionId),

    /// Another consumer is already attached.
    #[error("session {0} already has an attached consumer")]
    Conflict(SessionId),

    /// The session's process has exited or was terminated.
    #[error("process of session {0} is gone")]
    ProcessGone(SessionId),

    /// The requested workspace is not allowed.
    #[error("workspace {path} rejected: {reason}")]
    WorkspaceDenied { path: String, reason: String },

    /// The tool process could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Session Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new session was created.
    Created {
        session_id: SessionId,
        principal: Principal,
        tool: ToolKind,
    },

    /// A session moved to a new lifecycle state.
    StateChanged {
        session_id: SessionId,
        principal: Principal,
        state: SessionState,
    },

    /// A session was removed from the registry.
    Removed {
        session_id: SessionId,
        principal: Principal,
        reason: RemovalReason,
    },
}

impl SessionEvent {
    /// Principal owning the session the event is about.
    pub fn principal(&self) -> &Principal {
        match self {
            Self::Created { principal, .. }
            | Self::StateChanged { principal, .. }
            | Self::Removed { principal, .. } => principal,
        }
    }
}

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// No client activity for longer than the idle timeout.
    Idle,

    /// A consumer saw the EXIT event and detached.
    Acknowledged,

    /// The daemon is shutting down.
    Shutdown,
}

impl RemovalReason {
    /// Short machine-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acknowledged => "acknowledged",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle timeout exceeded"),
            Self::Acknowledged => write!(f, "exit acknowledged by consumer"),
            Self::Shutdown => write!(f, "daemon shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::RegistryFull { max: 100 };
        assert_eq!(err.to_string(), "registry is full (max: 100 sessions)");

        let err = RegistryError::SessionNotFound(SessionId::new("test-123"));
        assert_eq!(err.to_string(), "session not found: test-123");

        let err = RegistryError::Conflict(SessionId::new("test-456"));
        assert_eq!(
            err.to_string(),
            "session test-456 already has an attached consumer"
        );

        let err = RegistryError::ChannelClosed;
        assert_eq!(err.to_string(), "response channel closed");
    }

    #[test]
    fn test_spawn_error_converts() {
        let err: RegistryError = SpawnError::CommandNotFound {
            command: "claude".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "command not found: claude");
    }

    #[test]
    fn test_removal_reason_display() {
        assert_eq!(RemovalReason::Idle.to_string(), "idle timeout exceeded");
        assert_eq!(
            RemovalReason::Acknowledged.to_string(),
            "exit acknowledged by consumer"
        );
        assert_eq!(RemovalReason::Shutdown.as_str(), "shutdown");
    }

    #[test]
    fn test_session_event_principal() {
        let principal = Principal::parse("phone").unwrap();
        let event = SessionEvent::Removed {
            session_id: SessionId::new("s"),
            principal: principal.clone(),
            reason: RemovalReason::Idle,
        };
        assert_eq!(event.principal(), &principal);
        let _cloned = event.clone();
    }

    #[tokio::test]
    async fn test_command_channel_closed_error() {
        // Verify behavior when channel is dropped
        let (tx, rx) = oneshot::channel::<Result<usize, RegistryError>>();
        drop(tx);
        assert!(rx.await.is_err());
    }
}
