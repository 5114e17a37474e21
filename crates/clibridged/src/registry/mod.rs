//! Session registry using Actor pattern.
//!
//! The registry is the central state manager for all bridged CLI sessions.
//! It receives commands via a tokio mpsc channel and is the single source
//! of truth for which sessions exist, who owns them, and who is attached.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  HTTP Gateway   │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                  │           ▲                 │
//!         │ RegistryCommand  │ spawn     │ ProcessExited   │ SessionEvent
//!         ▼                  ▼           │                 ▼
//!   Create/Attach/     ProcessSupervisor │           GET /events
//!   Input/Terminate          │           │
//!                            ▼           │
//!                       OutputPump ──────┘
//!                            │
//!                            ▼
//!                       SessionFeed (EventLog) ───▶ attached consumer
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::time::Duration;

use clibridge_core::{ToolOverrides, DEFAULT_EVENT_LOG_CAPACITY};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::debug;

mod actor;
mod commands;
mod feed;
mod handle;
mod pump;
mod workspace;

pub use actor::{RegistryActor, MAX_SESSIONS};
pub use commands::{Attachment, RegistryCommand, RegistryError, RemovalReason, SessionEvent};
pub use feed::SessionFeed;
pub use handle::{ConsumerLease, RegistryHandle};
pub use workspace::WorkspacePolicy;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Registry limits and timings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    /// Sessions without client activity for this long are evicted
    pub idle_timeout: Duration,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
    /// Events retained per session
    pub event_log_capacity: usize,
    /// Time between SIGTERM and SIGKILL
    pub grace_period: Duration,
    pub tool_overrides: ToolOverrides,
    pub workspace: WorkspacePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: MAX_SESSIONS,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30),
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            grace_period: Duration::from_secs(5),
            tool_overrides: ToolOverrides::default(),
            workspace: WorkspacePolicy::default(),
        }
    }
}

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Spawns a background idle-sweep task
/// 4. Returns a RegistryHandle for client use
///
/// Must be called from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use clibridged::registry::{spawn_registry, RegistryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(RegistryConfig::default());
///
///     let sessions = handle.list_sessions(None).await;
/// }
/// ```
pub fn spawn_registry(config: RegistryConfig) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let handle = RegistryHandle::new(
        cmd_tx.clone(),
        event_tx.clone(),
        config.workspace.clone(),
        config.grace_period,
    );

    let sweep_interval = config.sweep_interval;
    let actor = RegistryActor::new(cmd_rx, cmd_tx.downgrade(), event_tx, config);
    tokio::spawn(actor.run());

    spawn_sweep_task(cmd_tx, sweep_interval);

    handle
}

/// Spawn a background task that triggers periodic idle eviction.
///
/// Holds only a weak sender so the actor stops once every handle is gone.
fn spawn_sweep_task(sender: mpsc::Sender<RegistryCommand>, period: Duration) {
    let sender = sender.downgrade();
    // interval() panics on a zero period
    let period = period.max(Duration::from_millis(100));

    tokio::spawn(async move {
        let mut ticker = interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(sender) = sender.upgrade() else {
                debug!("Sweep task stopping: registry handles dropped");
                break;
            };

            // Fire-and-forget sweep command
            if sender
                .send(RegistryCommand::Sweep { respond_to: None })
                .await
                .is_err()
            {
                debug!("Sweep task stopping: registry channel closed");
                break;
            }
        }
    });
}
