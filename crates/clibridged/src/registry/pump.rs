//! Per-session output pump.
//!
//! Moves process output into the session feed for as long as the process
//! lives, independent of whether a consumer is attached. Once EXIT is
//! recorded the pump tells the registry actor through a weak sender, so a
//! pump never keeps the actor alive.

use std::sync::Arc;
use std::time::Duration;

use clibridge_core::{ExitInfo, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::commands::RegistryCommand;
use super::feed::SessionFeed;
use crate::supervisor::{OutputChunk, ProcessOutput};

pub(super) struct OutputPump {
    pub session_id: SessionId,
    pub output: ProcessOutput,
    pub feed: Arc<SessionFeed>,
    pub cancel: CancellationToken,
    /// How long a cancelled pump keeps draining to capture EXIT
    pub drain: Duration,
    pub notify: mpsc::WeakSender<RegistryCommand>,
}

impl OutputPump {
    pub(super) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let exit = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "Output pump cancelled, draining");
                    break self.drain_after_cancel().await;
                }

                chunk = self.output.poll() => match chunk {
                    Some(chunk) => {
                        if let Some(exit) = record(&self.feed, chunk) {
                            break exit;
                        }
                    }
                    None => break self.missing_exit(),
                },
            }
        };

        if let Some(sender) = self.notify.upgrade() {
            let _ = sender
                .send(RegistryCommand::ProcessExited {
                    session_id: self.session_id.clone(),
                    exit,
                })
                .await;
        }
        debug!(session_id = %self.session_id, exit = %exit, "Output pump finished");
    }

    async fn drain_after_cancel(&mut self) -> ExitInfo {
        let feed = Arc::clone(&self.feed);
        let output = &mut self.output;
        let drained = timeout(self.drain, async move {
            while let Some(chunk) = output.poll().await {
                if let Some(exit) = record(&feed, chunk) {
                    return Some(exit);
                }
            }
            None
        })
        .await;

        match drained {
            Ok(Some(exit)) => exit,
            Ok(None) => self.missing_exit(),
            Err(_) => {
                warn!(session_id = %self.session_id, "Process did not report exit while draining");
                self.missing_exit()
            }
        }
    }

    /// Records an EXIT with unknown status so consumers still see one.
    fn missing_exit(&self) -> ExitInfo {
        let exit = ExitInfo::default();
        self.feed.append_exit(exit);
        exit
    }
}

/// Appends one chunk; returns the exit status when the chunk was EXIT.
fn record(feed: &SessionFeed, chunk: OutputChunk) -> Option<ExitInfo> {
    match chunk {
        OutputChunk::Stdout(bytes) => {
            feed.append_output(bytes);
            None
        }
        OutputChunk::Stderr(bytes) => {
            feed.append_error(bytes);
            None
        }
        OutputChunk::Exited(exit) => {
            feed.append_exit(exit);
            Some(exit)
        }
    }
}
