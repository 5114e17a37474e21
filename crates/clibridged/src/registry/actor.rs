//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of session state in the system.
//! It receives commands via an mpsc channel and publishes events via broadcast.
//! It never awaits process I/O: spawning is synchronous, stdin writes are
//! queued, and termination is requested rather than awaited.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clibridge_core::{
    ConsumerId, ContinuationToken, ExitInfo, Principal, SessionId, SessionRecord, SessionState,
    SessionView, ToolKind,
};

use super::commands::{Attachment, RegistryCommand, RegistryError, RemovalReason, SessionEvent};
use super::feed::SessionFeed;
use super::pump::OutputPump;
use super::RegistryConfig;
use crate::supervisor::{ProcessHandle, ProcessSupervisor};

// ============================================================================
// Resource Limits
// ============================================================================

/// Default maximum number of sessions the registry can hold.
pub const MAX_SESSIONS: usize = 100;

/// Extra time a cancelled pump waits beyond the grace period for EXIT.
const PUMP_DRAIN_MARGIN: std::time::Duration = std::time::Duration::from_secs(3);

// ============================================================================
// Registry Actor
// ============================================================================

/// Everything the registry owns for one session.
struct SessionEntry {
    record: SessionRecord,
    feed: Arc<SessionFeed>,
    /// Dropping this kills the process if it is still running
    process: ProcessHandle,
    consumer: Option<ConsumerId>,
    pump_cancel: CancellationToken,
}

impl SessionEntry {
    fn view(&self) -> SessionView {
        SessionView::from_record(&self.record, self.consumer.is_some())
    }
}

/// The registry actor - owns all session state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
///
/// # Ownership
///
/// The actor owns every session's record, process handle and consumer
/// slot. The event feed is shared with the session's output pump and its
/// consumer, both of which only ever append to or read from it.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Weak sender handed to output pumps for exit notifications
    self_sender: mpsc::WeakSender<RegistryCommand>,

    sessions: HashMap<SessionId, SessionEntry>,

    config: RegistryConfig,
    supervisor: ProcessSupervisor,

    /// Event publisher for lifecycle updates
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `self_sender` - Weak handle to the same channel, for output pumps
    /// * `event_publisher` - Broadcast channel for publishing events
    /// * `config` - Capacity, timeouts and tool settings
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        self_sender: mpsc::WeakSender<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            sessions: HashMap::new(),
            config,
            supervisor: ProcessSupervisor::default(),
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    /// Remaining sessions are dropped on exit, which kills their processes.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sessions = self.sessions.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Create {
                principal,
                tool,
                continuation,
                workspace,
                respond_to,
            } => {
                let result = self.handle_create(principal, tool, continuation, workspace);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Attach {
                session_id,
                principal,
                respond_to,
            } => {
                let result = self.handle_attach(&session_id, &principal);
                // Requester gone before the reply: release the slot it would have held
                if let Err(Ok(attachment)) = respond_to.send(result) {
                    debug!(session_id = %session_id, "Attach reply dropped, releasing consumer");
                    self.handle_detach(&session_id, &attachment.consumer_id, false);
                }
            }
            RegistryCommand::Detach {
                session_id,
                consumer_id,
                exit_acknowledged,
                respond_to,
            } => {
                self.handle_detach(&session_id, &consumer_id, exit_acknowledged);
                let _ = respond_to.send(());
            }
            RegistryCommand::Input {
                session_id,
                principal,
                data,
                respond_to,
            } => {
                let result = self.handle_input(&session_id, &principal, &data);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Terminate {
                session_id,
                principal,
                respond_to,
            } => {
                let result = self.handle_terminate(&session_id, &principal);
                let _ = respond_to.send(result);
            }
            RegistryCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let result = self.sessions.get(&session_id).map(SessionEntry::view);
                let _ = respond_to.send(result);
            }
            RegistryCommand::ListSessions {
                principal,
                respond_to,
            } => {
                let result = self.handle_list(principal.as_ref());
                let _ = respond_to.send(result);
            }
            RegistryCommand::ProcessExited { session_id, exit } => {
                self.handle_process_exited(&session_id, exit);
            }
            RegistryCommand::Sweep { respond_to } => {
                let removed = self.handle_sweep();
                if let Some(tx) = respond_to {
                    let _ = tx.send(removed);
                }
            }
            RegistryCommand::Shutdown { respond_to } => {
                let feeds = self.handle_shutdown();
                let _ = respond_to.send(feeds);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Handles session creation: spawn, then register.
    ///
    /// Nothing is registered when the spawn fails.
    fn handle_create(
        &mut self,
        principal: Principal,
        tool: ToolKind,
        continuation: Option<ContinuationToken>,
        workspace: Option<PathBuf>,
    ) -> Result<SessionView, RegistryError> {
        if self.sessions.len() >= self.config.max_sessions {
            warn!(
                principal = %principal,
                current = self.sessions.len(),
                max = self.config.max_sessions,
                "Registry is full, rejecting session"
            );
            return Err(RegistryError::RegistryFull {
                max: self.config.max_sessions,
            });
        }

        let launch = tool.launch(
            &self.config.tool_overrides,
            continuation.as_ref(),
            workspace.clone(),
        );

        let (process, output) = self.supervisor.spawn(&launch.spec).map_err(|e| {
            warn!(
                tool = %tool,
                principal = %principal,
                command = %launch.spec.display_command(),
                error = %e,
                "Failed to spawn tool"
            );
            RegistryError::from(e)
        })?;

        let mut record = SessionRecord::new(principal, tool);
        record.pid = process.pid();
        record.continuation = launch.continuation;
        record.workspace = workspace;

        let feed = Arc::new(SessionFeed::new(self.config.event_log_capacity));
        let pump_cancel = CancellationToken::new();

        OutputPump {
            session_id: record.id.clone(),
            output,
            feed: Arc::clone(&feed),
            cancel: pump_cancel.clone(),
            drain: self.config.grace_period + PUMP_DRAIN_MARGIN,
            notify: self.self_sender.clone(),
        }
        .spawn();

        info!(
            session_id = %record.id,
            principal = %record.principal,
            tool = %tool,
            pid = ?record.pid,
            total_sessions = self.sessions.len() + 1,
            "Session created"
        );

        let _ = self.event_publisher.send(SessionEvent::Created {
            session_id: record.id.clone(),
            principal: record.principal.clone(),
            tool,
        });

        let entry = SessionEntry {
            record,
            feed,
            process,
            consumer: None,
            pump_cancel,
        };
        let view = entry.view();
        self.sessions.insert(view.id.clone(), entry);

        Ok(view)
    }

    /// Looks up a session and checks ownership.
    fn owned_entry_mut(
        &mut self,
        session_id: &SessionId,
        principal: &Principal,
    ) -> Result<&mut SessionEntry, RegistryError> {
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;

        if !entry.record.is_owned_by(principal) {
            warn!(
                session_id = %session_id,
                principal = %principal,
                "Rejected access to another principal's session"
            );
            return Err(RegistryError::Forbidden(session_id.clone()));
        }

        Ok(entry)
    }

    /// Handles attaching the single consumer.
    ///
    /// Terminal sessions can still be attached so the consumer sees EXIT.
    fn handle_attach(
        &mut self,
        session_id: &SessionId,
        principal: &Principal,
    ) -> Result<Attachment, RegistryError> {
        let entry = self.owned_entry_mut(session_id, principal)?;

        if entry.consumer.is_some() {
            debug!(session_id = %session_id, "Attach rejected, consumer already present");
            return Err(RegistryError::Conflict(session_id.clone()));
        }

        let consumer_id = ConsumerId::generate();
        entry.consumer = Some(consumer_id.clone());
        entry.record.touch();

        debug!(
            session_id = %session_id,
            consumer_id = %consumer_id,
            state = %entry.record.state,
            "Consumer attached"
        );

        Ok(Attachment {
            session: entry.view(),
            consumer_id,
            feed: Arc::clone(&entry.feed),
        })
    }

    /// Handles detaching a consumer. Idempotent.
    fn handle_detach(
        &mut self,
        session_id: &SessionId,
        consumer_id: &ConsumerId,
        exit_acknowledged: bool,
    ) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return;
        };

        if entry.consumer.as_ref() != Some(consumer_id) {
            debug!(session_id = %session_id, consumer_id = %consumer_id, "Ignoring stale detach");
            return;
        }

        entry.consumer = None;
        entry.record.touch();
        debug!(session_id = %session_id, consumer_id = %consumer_id, "Consumer detached");

        if exit_acknowledged && entry.record.state.is_terminal() {
            self.remove_session(session_id, RemovalReason::Acknowledged);
        }
    }

    /// Handles forwarding input to the process.
    fn handle_input(
        &mut self,
        session_id: &SessionId,
        principal: &Principal,
        data: &[u8],
    ) -> Result<usize, RegistryError> {
        let entry = self.owned_entry_mut(session_id, principal)?;

        if entry.record.state.is_terminal() {
            return Err(RegistryError::ProcessGone(session_id.clone()));
        }

        entry
            .process
            .write(data)
            .map_err(|_| RegistryError::ProcessGone(session_id.clone()))?;
        entry.record.touch();

        debug!(session_id = %session_id, bytes = data.len(), "Input forwarded");
        Ok(data.len())
    }

    /// Handles explicit termination.
    fn handle_terminate(
        &mut self,
        session_id: &SessionId,
        principal: &Principal,
    ) -> Result<Arc<SessionFeed>, RegistryError> {
        let grace = self.config.grace_period;
        let entry = self.owned_entry_mut(session_id, principal)?;
        entry.record.touch();
        let feed = Arc::clone(&entry.feed);
        let pid = entry.record.pid;

        if Self::terminate_entry(entry, grace) {
            info!(session_id = %session_id, pid = ?pid, "Session terminated");
            let _ = self.event_publisher.send(SessionEvent::StateChanged {
                session_id: session_id.clone(),
                principal: principal.clone(),
                state: SessionState::Terminated,
            });
        }

        Ok(feed)
    }

    /// Marks an entry terminated and stops its process and pump.
    ///
    /// Returns false if the session was already terminal.
    fn terminate_entry(entry: &mut SessionEntry, grace: std::time::Duration) -> bool {
        if !entry.record.mark_terminated() {
            return false;
        }
        entry.process.signal_terminate(grace);
        entry.pump_cancel.cancel();
        true
    }

    fn handle_list(&self, principal: Option<&Principal>) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self
            .sessions
            .values()
            .filter(|entry| principal.map_or(true, |p| entry.record.is_owned_by(p)))
            .map(SessionEntry::view)
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    /// Handles the pump's report that EXIT was recorded.
    fn handle_process_exited(&mut self, session_id: &SessionId, exit: ExitInfo) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            debug!(session_id = %session_id, "Exit reported for removed session");
            return;
        };

        let was_running = entry.record.state == SessionState::Running;
        entry.record.mark_exited(exit);

        if was_running {
            info!(session_id = %session_id, exit = %exit, "Session process exited");
            let _ = self.event_publisher.send(SessionEvent::StateChanged {
                session_id: session_id.clone(),
                principal: entry.record.principal.clone(),
                state: entry.record.state,
            });
        }
    }

    /// Handles idle eviction.
    ///
    /// Sessions with an attached consumer are never idle. Idle running
    /// sessions are terminated gracefully before removal; dropping the
    /// entry right after queues the kill behind the graceful request.
    fn handle_sweep(&mut self) -> usize {
        let now = Utc::now();
        let timeout = self.config.idle_timeout;
        let grace = self.config.grace_period;

        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.consumer.is_none() && entry.record.is_idle(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();

        if idle.is_empty() {
            debug!("No idle sessions to evict");
            return 0;
        }

        info!(count = idle.len(), "Evicting idle sessions");

        for session_id in &idle {
            if let Some(entry) = self.sessions.get_mut(session_id) {
                let idle_secs = entry.record.idle_for(now).as_secs();
                Self::terminate_entry(entry, grace);
                // Use warn! so it shows up without RUST_LOG=debug
                warn!(
                    session_id = %session_id,
                    idle_secs = idle_secs,
                    reason = %RemovalReason::Idle,
                    "Session evicted"
                );
            }
            self.remove_session(session_id, RemovalReason::Idle);
        }

        idle.len()
    }

    /// Terminates every running session and removes all of them.
    fn handle_shutdown(&mut self) -> Vec<Arc<SessionFeed>> {
        let grace = self.config.grace_period;
        let mut feeds = Vec::new();

        for entry in self.sessions.values_mut() {
            if Self::terminate_entry(entry, grace) {
                feeds.push(Arc::clone(&entry.feed));
            }
        }

        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        for session_id in &ids {
            self.remove_session(session_id, RemovalReason::Shutdown);
        }

        info!(terminated = feeds.len(), "Registry shut down all sessions");
        feeds
    }

    fn remove_session(&mut self, session_id: &SessionId, reason: RemovalReason) {
        let Some(entry) = self.sessions.remove(session_id) else {
            return;
        };

        info!(
            session_id = %session_id,
            reason = %reason,
            remaining_sessions = self.sessions.len(),
            "Session removed"
        );

        let _ = self.event_publisher.send(SessionEvent::Removed {
            session_id: session_id.clone(),
            principal: entry.record.principal.clone(),
            reason,
        });
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    /// Returns the number of sessions currently registered.
    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
