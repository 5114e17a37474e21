//! Shared per-session event feed.
//!
//! The output pump appends under a short mutex; consumers are woken through
//! a `watch` of the newest id and read their own slice. A writer never
//! waits on a reader, so a slow or absent client cannot stall the process.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clibridge_core::{EventLog, ExitInfo, Replay};
use tokio::sync::watch;
use tokio::time::timeout;

/// An [`EventLog`] plus change notification.
pub struct SessionFeed {
    log: Mutex<EventLog>,
    newest: watch::Sender<u64>,
}

impl SessionFeed {
    /// Creates an empty feed retaining `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (newest, _) = watch::channel(0);
        Self {
            log: Mutex::new(EventLog::new(capacity)),
            newest,
        }
    }

    fn log(&self) -> MutexGuard<'_, EventLog> {
        // The log is never left half-updated, so a poisoned lock is still usable.
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, id: u64) -> u64 {
        self.newest.send_replace(id);
        id
    }

    pub fn append_output(&self, bytes: Vec<u8>) -> u64 {
        let id = self.log().append_output(bytes);
        self.publish(id)
    }

    pub fn append_error(&self, bytes: Vec<u8>) -> u64 {
        let id = self.log().append_error(bytes);
        self.publish(id)
    }

    pub fn append_exit(&self, exit: ExitInfo) -> u64 {
        let id = self.log().append_exit(exit);
        self.publish(id)
    }

    /// Events after `last_id`; see [`EventLog::range_from`].
    #[must_use]
    pub fn replay_from(&self, last_id: u64) -> Replay {
        self.log().range_from(last_id)
    }

    /// Receiver that changes whenever an event is appended.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.newest.subscribe()
    }

    #[must_use]
    pub fn newest_id(&self) -> u64 {
        self.log().newest_id()
    }

    #[must_use]
    pub fn has_exit(&self) -> bool {
        self.log().has_exit()
    }

    /// Waits up to `limit` for the EXIT event. Returns whether it arrived.
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut updates = self.subscribe();
        let waited = timeout(limit, async {
            loop {
                if self.has_exit() {
                    return;
                }
                if updates.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        waited.is_ok() && self.has_exit()
    }
}

impl fmt::Debug for SessionFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self.log();
        f.debug_struct("SessionFeed")
            .field("newest_id", &log.newest_id())
            .field("retained", &log.len())
            .field("has_exit", &log.has_exit())
            .finish()
    }
}
