//! Server-Sent Event streams.
//!
//! A session stream owns the session's [`ConsumerLease`] for its whole
//! life. Dropping the stream (client disconnect) drops the lease, which
//! detaches the consumer but leaves the session running.
//!
//! ```text
//!   replay_from(last_id) ──▶ gap? ──▶ events ──▶ EXIT? ──▶ ack + end
//!          ▲                                        │ no
//!          │                                        ▼
//!          └──────── feed changed ◀──── wait ────▶ heartbeat tick
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::Event as SseEvent;
use futures_util::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use clibridge_core::{EventKind, Principal, Replay, SessionState};
use clibridge_protocol::{GlobalEvent, StreamFrame};

use crate::registry::{ConsumerLease, SessionEvent};

/// Lower bound for the heartbeat period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Converts a framework-independent frame into an axum SSE event.
pub fn to_sse(frame: &StreamFrame) -> SseEvent {
    let event = SseEvent::default().event(frame.event).data(&frame.data);
    match frame.id {
        Some(id) => event.id(id.to_string()),
        None => event,
    }
}

enum Wake {
    Appended,
    Heartbeat,
    Closed,
}

/// Frames for one attached consumer, starting after `last_id`.
///
/// A `last_id` ahead of the feed is clamped to the newest id, so later
/// events are not skipped. Ends once the consumer has seen EXIT, either in
/// this stream or before resuming; the lease is then released with the exit
/// acknowledged.
pub fn session_frames(
    mut lease: ConsumerLease,
    mut last_id: u64,
    heartbeat: Duration,
) -> impl Stream<Item = StreamFrame> {
    let heartbeat = heartbeat.max(MIN_HEARTBEAT);
    stream! {
        let feed = Arc::clone(lease.feed());
        let mut updates = feed.subscribe();
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let newest = feed.newest_id();
        if last_id > newest {
            debug!(
                session_id = %lease.session().id,
                requested_after = last_id,
                newest,
                "Resume position ahead of the feed, clamping"
            );
            last_id = newest;
        }

        loop {
            let replay = feed.replay_from(last_id);
            if let Replay::Gap { requested_after, first_available, .. } = &replay {
                debug!(
                    session_id = %lease.session().id,
                    requested_after,
                    first_available,
                    "Consumer resumed behind the retained window"
                );
                yield StreamFrame::gap(*requested_after, *first_available);
            }

            let mut exited = false;
            for event in replay.into_events() {
                last_id = event.id;
                exited |= event.kind == EventKind::Exit;
                yield StreamFrame::from_event(&event);
            }

            // EXIT is always the final event
            if exited || (feed.has_exit() && last_id >= feed.newest_id()) {
                lease.acknowledge_exit();
                break;
            }

            let wake = tokio::select! {
                changed = updates.changed() => {
                    if changed.is_ok() { Wake::Appended } else { Wake::Closed }
                }
                _ = ticker.tick() => Wake::Heartbeat,
            };

            match wake {
                Wake::Appended => {}
                Wake::Heartbeat => yield StreamFrame::heartbeat(),
                Wake::Closed => break,
            }
        }

        debug!(session_id = %lease.session().id, last_id, "Session stream finished");
        lease.release().await;
    }
}

/// [`session_frames`] as SSE events.
pub fn session_stream(
    lease: ConsumerLease,
    last_id: u64,
    heartbeat: Duration,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream! {
        for await frame in session_frames(lease, last_id, heartbeat) {
            yield Ok(to_sse(&frame));
        }
    }
}

/// Converts a registry event into its global form, if `principal` may see it.
pub fn global_from_session_event(event: &SessionEvent, principal: &Principal) -> Option<GlobalEvent> {
    if event.principal() != principal {
        return None;
    }

    Some(match event {
        SessionEvent::Created { session_id, .. } => GlobalEvent::SessionStateChanged {
            session_id: session_id.clone(),
            state: SessionState::Running,
        },
        SessionEvent::StateChanged {
            session_id, state, ..
        } => GlobalEvent::SessionStateChanged {
            session_id: session_id.clone(),
            state: *state,
        },
        SessionEvent::Removed {
            session_id, reason, ..
        } => GlobalEvent::SessionRemoved {
            session_id: session_id.clone(),
            reason: reason.as_str().to_string(),
        },
    })
}

fn global_frame(event: &GlobalEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event.name()).data(data)
}

enum GlobalWake {
    Hub(Result<GlobalEvent, RecvError>),
    Session(Result<SessionEvent, RecvError>),
    Heartbeat,
}

/// The `GET /events` stream: hub events plus the principal's session events.
pub fn global_stream(
    mut hub: tokio::sync::broadcast::Receiver<GlobalEvent>,
    mut sessions: tokio::sync::broadcast::Receiver<SessionEvent>,
    principal: Principal,
    heartbeat: Duration,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let heartbeat = heartbeat.max(MIN_HEARTBEAT);
    stream! {
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                event = hub.recv() => GlobalWake::Hub(event),
                event = sessions.recv() => GlobalWake::Session(event),
                _ = ticker.tick() => GlobalWake::Heartbeat,
            };

            match wake {
                GlobalWake::Hub(Ok(event)) => yield Ok(global_frame(&event)),
                GlobalWake::Session(Ok(event)) => {
                    if let Some(event) = global_from_session_event(&event, &principal) {
                        yield Ok(global_frame(&event));
                    }
                }
                GlobalWake::Hub(Err(RecvError::Lagged(n)))
                | GlobalWake::Session(Err(RecvError::Lagged(n))) => {
                    debug!(skipped = n, "Global event subscriber lagged");
                }
                GlobalWake::Hub(Err(RecvError::Closed))
                | GlobalWake::Session(Err(RecvError::Closed)) => break,
                GlobalWake::Heartbeat => yield Ok(to_sse(&StreamFrame::heartbeat())),
            }
        }
    }
}
