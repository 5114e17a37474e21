//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to session events. A successful
//! attach yields a [`ConsumerLease`], which detaches when released or dropped.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use clibridge_core::{ConsumerId, ContinuationToken, Principal, SessionId, SessionView, ToolKind};

use super::commands::{RegistryCommand, RegistryError, SessionEvent};
use super::feed::SessionFeed;
use super::workspace::WorkspacePolicy;

/// Extra time `terminate` waits for EXIT beyond the grace period.
const TERMINATE_WAIT_MARGIN: Duration = Duration::from_secs(2);

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
///
/// # Usage
///
/// ```ignore
/// let view = handle.create(principal.clone(), ToolKind::Claude, None, None).await?;
///
/// let lease = handle.attach(view.id.clone(), principal.clone()).await?;
/// handle.input(view.id.clone(), principal, b"hello\n".to_vec()).await?;
///
/// lease.release().await;
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<SessionEvent>,

    /// Workspace validation happens here, off the actor task
    workspace: WorkspacePolicy,

    grace_period: Duration,
}

impl RegistryHandle {
    /// Create a new registry handle.
    ///
    /// # Arguments
    ///
    /// * `sender` - The command channel sender for communicating with the actor
    /// * `event_sender` - The broadcast sender for subscribing to events
    /// * `workspace` - Policy for requested working directories
    /// * `grace_period` - SIGTERM to SIGKILL delay used by `terminate`
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
        workspace: WorkspacePolicy,
        grace_period: Duration,
    ) -> Self {
        Self {
            sender,
            event_sender,
            workspace,
            grace_period,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Spawn a tool and register a new session for it.
    ///
    /// # Errors
    ///
    /// - `RegistryError::WorkspaceDenied` if the workspace fails validation
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::Spawn` if the tool could not be started
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn create(
        &self,
        principal: Principal,
        tool: ToolKind,
        continuation: Option<ContinuationToken>,
        workspace: Option<&str>,
    ) -> Result<SessionView, RegistryError> {
        let workspace = self.workspace.resolve(workspace).await?;

        self.request(|respond_to| RegistryCommand::Create {
            principal,
            tool,
            continuation,
            workspace,
            respond_to,
        })
        .await?
    }

    /// Attach as the session's single consumer.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` / `Forbidden`
    /// - `RegistryError::Conflict` if a consumer is already attached
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn attach(
        &self,
        session_id: SessionId,
        principal: Principal,
    ) -> Result<ConsumerLease, RegistryError> {
        let attachment = self
            .request(|respond_to| RegistryCommand::Attach {
                session_id,
                principal,
                respond_to,
            })
            .await??;

        Ok(ConsumerLease {
            registry: self.clone(),
            session: attachment.session,
            consumer_id: attachment.consumer_id,
            feed: attachment.feed,
            exit_acknowledged: false,
            released: false,
        })
    }

    /// Release an attachment. Stale consumer ids are ignored.
    pub async fn detach(
        &self,
        session_id: SessionId,
        consumer_id: ConsumerId,
        exit_acknowledged: bool,
    ) {
        let _ = self
            .request(|respond_to| RegistryCommand::Detach {
                session_id,
                consumer_id,
                exit_acknowledged,
                respond_to,
            })
            .await;
    }

    /// Forward bytes to the session's process.
    ///
    /// Returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` / `Forbidden`
    /// - `RegistryError::ProcessGone` if the process has exited or was terminated
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn input(
        &self,
        session_id: SessionId,
        principal: Principal,
        data: Vec<u8>,
    ) -> Result<usize, RegistryError> {
        self.request(|respond_to| RegistryCommand::Input {
            session_id,
            principal,
            data,
            respond_to,
        })
        .await?
    }

    /// Terminate a session and wait for its EXIT event.
    ///
    /// Returns once EXIT is recorded or the grace period plus a short margin
    /// has passed. Terminating an already terminal session succeeds.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` / `Forbidden`
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn terminate(
        &self,
        session_id: SessionId,
        principal: Principal,
    ) -> Result<(), RegistryError> {
        let feed = self
            .request(|respond_to| RegistryCommand::Terminate {
                session_id: session_id.clone(),
                principal,
                respond_to,
            })
            .await??;

        if !feed
            .wait_for_exit(self.grace_period + TERMINATE_WAIT_MARGIN)
            .await
        {
            debug!(session_id = %session_id, "Terminate returned before EXIT was recorded");
        }
        Ok(())
    }

    /// Get a single session by ID.
    ///
    /// Returns `None` if the session doesn't exist or if communication
    /// with the actor fails.
    pub async fn get_session(&self, session_id: SessionId) -> Option<SessionView> {
        self.request(|respond_to| RegistryCommand::GetSession {
            session_id,
            respond_to,
        })
        .await
        .ok()?
    }

    /// List sessions, optionally restricted to one principal.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn list_sessions(&self, principal: Option<Principal>) -> Vec<SessionView> {
        self.request(|respond_to| RegistryCommand::ListSessions {
            principal,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    /// Number of sessions currently held, across all principals.
    pub async fn session_count(&self) -> usize {
        self.list_sessions(None).await.len()
    }

    /// Trigger idle eviction without waiting for the result.
    pub async fn sweep(&self) {
        // Fire-and-forget: ignore send errors (actor may be shutting down)
        let _ = self
            .sender
            .send(RegistryCommand::Sweep { respond_to: None })
            .await;
    }

    /// Run idle eviction and return how many sessions were removed.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn sweep_now(&self) -> Result<usize, RegistryError> {
        self.request(|respond_to| RegistryCommand::Sweep {
            respond_to: Some(respond_to),
        })
        .await
    }

    /// Terminate every running session and wait for their EXIT events.
    ///
    /// Returns the number of sessions that were terminated.
    pub async fn shutdown(&self) -> usize {
        let feeds = self
            .request(|respond_to| RegistryCommand::Shutdown { respond_to })
            .await
            .unwrap_or_default();

        let limit = self.grace_period + TERMINATE_WAIT_MARGIN;
        let waits = feeds.iter().map(|feed| feed.wait_for_exit(limit));
        let exited = futures_util::future::join_all(waits).await;
        debug!(
            terminated = feeds.len(),
            confirmed = exited.iter().filter(|ok| **ok).count(),
            "Registry shutdown complete"
        );
        feeds.len()
    }

    /// Subscribe to session events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Check if the actor is still running.
    ///
    /// Returns `true` if the command channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

// ============================================================================
// Consumer Lease
// ============================================================================

/// An active attachment to a session.
///
/// Releasing the lease (or dropping it inside a runtime) detaches the
/// consumer. If [`acknowledge_exit`](Self::acknowledge_exit) was called the
/// detach also removes a terminal session.
pub struct ConsumerLease {
    registry: RegistryHandle,
    session: SessionView,
    consumer_id: ConsumerId,
    feed: Arc<SessionFeed>,
    exit_acknowledged: bool,
    released: bool,
}

impl ConsumerLease {
    /// Session snapshot taken at attach time.
    pub fn session(&self) -> &SessionView {
        &self.session
    }

    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    pub fn feed(&self) -> &Arc<SessionFeed> {
        &self.feed
    }

    /// Marks that the EXIT event was delivered to this consumer.
    pub fn acknowledge_exit(&mut self) {
        self.exit_acknowledged = true;
    }

    /// Detaches and waits for the registry to process it.
    pub async fn release(mut self) {
        self.released = true;
        self.registry
            .detach(
                self.session.id.clone(),
                self.consumer_id.clone(),
                self.exit_acknowledged,
            )
            .await;
    }
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(session_id = %self.session.id, "Lease dropped outside runtime, not detaching");
            return;
        };

        let registry = self.registry.clone();
        let session_id = self.session.id.clone();
        let consumer_id = self.consumer_id.clone();
        let acknowledged = self.exit_acknowledged;
        runtime.spawn(async move {
            registry.detach(session_id, consumer_id, acknowledged).await;
        });
    }
}

impl std::fmt::Debug for ConsumerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLease")
            .field("session_id", &self.session.id)
            .field("consumer_id", &self.consumer_id)
            .field("exit_acknowledged", &self.exit_acknowledged)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::commands::Attachment;
    use clibridge_core::{SessionRecord, SessionState};

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        let handle = RegistryHandle::new(
            cmd_tx,
            event_tx,
            WorkspacePolicy::default(),
            Duration::from_millis(50),
        );
        (handle, cmd_rx)
    }

    fn test_view(id: &str) -> SessionView {
        let mut record = SessionRecord::new(Principal::default(), ToolKind::EchoCli);
        record.id = SessionId::new(id);
        SessionView::from_record(&record, false)
    }

    #[tokio::test]
    async fn test_handle_is_clone() {
        let (handle, _rx) = create_test_handle();
        let _cloned = handle.clone();
    }

    #[tokio::test]
    async fn test_create_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Create {
                tool,
                workspace,
                respond_to,
                ..
            }) = rx.recv().await
            {
                assert_eq!(tool, ToolKind::Codex);
                assert!(workspace.is_none());
                let _ = respond_to.send(Ok(test_view("test-123")));
                return true;
            }
            false
        });

        let view = handle
            .create(Principal::default(), ToolKind::Codex, None, None)
            .await
            .unwrap();
        assert_eq!(view.id.as_str(), "test-123");
        assert_eq!(view.state, SessionState::Running);
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_create_rejects_workspace_before_sending() {
        let (handle, mut rx) = create_test_handle();

        let err = handle
            .create(Principal::default(), ToolKind::Codex, None, Some("/nonexistent/dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::WorkspaceDenied { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle
            .create(Principal::default(), ToolKind::Claude, None, None)
            .await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_get_session_returns_none_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.get_session(SessionId::new("test-123")).await.is_none());
        assert!(handle.list_sessions(None).await.is_empty());
        assert_eq!(handle.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_fire_and_forget() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            matches!(
                rx.recv().await,
                Some(RegistryCommand::Sweep { respond_to: None })
            )
        });

        handle.sweep().await;
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_release_sends_acknowledged_detach() {
        let (handle, mut rx) = create_test_handle();
        let feed = Arc::new(SessionFeed::new(8));
        let consumer_id = ConsumerId::generate();

        let expected = consumer_id.clone();
        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Attach { respond_to, .. }) = rx.recv().await {
                let _ = respond_to.send(Ok(Attachment {
                    session: test_view("test-123"),
                    consumer_id: expected.clone(),
                    feed,
                }));
            }
            match rx.recv().await {
                Some(RegistryCommand::Detach {
                    consumer_id,
                    exit_acknowledged,
                    respond_to,
                    ..
                }) => {
                    let _ = respond_to.send(());
                    consumer_id == expected && exit_acknowledged
                }
                _ => false,
            }
        });

        let mut lease = handle
            .attach(SessionId::new("test-123"), Principal::default())
            .await
            .unwrap();
        assert_eq!(lease.consumer_id(), &consumer_id);
        lease.acknowledge_exit();
        lease.release().await;

        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_drop_detaches() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Attach { respond_to, .. }) = rx.recv().await {
                let _ = respond_to.send(Ok(Attachment {
                    session: test_view("test-123"),
                    consumer_id: ConsumerId::generate(),
                    feed: Arc::new(SessionFeed::new(8)),
                }));
            }
            matches!(
                rx.recv().await,
                Some(RegistryCommand::Detach {
                    exit_acknowledged: false,
                    ..
                })
            )
        });

        let lease = handle
            .attach(SessionId::new("test-123"), Principal::default())
            .await
            .unwrap();
        drop(lease);

        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_is_connected() {
        let (handle, rx) = create_test_handle();
        assert!(handle.is_connected());

        drop(rx);
        assert!(!handle.is_connected());
    }
}
