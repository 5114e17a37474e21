//! Per-session event log.
//!
//! Every byte a CLI process writes ends up as an [`Event`] in its session's
//! [`EventLog`]. The log assigns strictly increasing, gapless ids starting
//! at 1 and retains the newest `capacity` events. Consumers resume by
//! asking for everything after the last id they saw.
//!
//! ```text
//!   evicted            retained window (capacity C)
//! ┌─────────┐ ┌────┬────┬────┬────┬────┬────┐
//! │ 1 .. 4  │ │ 5  │ 6  │ 7  │ 8  │ 9  │ 10 │ ◀── append
//! └─────────┘ └────┴────┴────┴────┴────┴────┘
//!                ▲
//!   range_from(6) → [7, 8, 9, 10]
//!   range_from(2) → Gap { first_available: 5, events: [5..=10] }
//! ```
//!
//! Heartbeats are rendered by the gateway on the wire and never stored;
//! they do not consume ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Default number of events retained per session.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 256;

// ============================================================================
// Event Types
// ============================================================================

/// Kind of an event in a session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Bytes the process wrote to stdout.
    Output,
    /// Bytes the process wrote to stderr.
    Error,
    /// The process ended; always the last stored event of a session.
    Exit,
    /// Keep-alive emitted by the gateway; never stored.
    Heartbeat,
}

impl EventKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Error => "error",
            Self::Exit => "exit",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process ended.
///
/// A process killed by a signal has no exit code; one that exited normally
/// has no signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    #[must_use]
    pub const fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Returns true for a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Payload carried by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Raw output bytes (OUTPUT / ERROR)
    Data(Vec<u8>),
    /// Exit status (EXIT)
    Exit(ExitInfo),
    /// No payload (HEARTBEAT)
    Empty,
}

impl EventPayload {
    /// Returns the raw bytes, or an empty slice for non-data payloads.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Data(bytes) => bytes,
            Self::Exit(_) | Self::Empty => &[],
        }
    }
}

/// One entry of a session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Sequence id, strictly increasing within a session (0 for heartbeats)
    pub id: u64,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Builds an unstored heartbeat event.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            id: 0,
            kind: EventKind::Heartbeat,
            payload: EventPayload::Empty,
            timestamp: Utc::now(),
        }
    }

    /// Returns the exit status if this is an EXIT event.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        match self.payload {
            EventPayload::Exit(info) => Some(info),
            _ => None,
        }
    }
}

/// Result of asking the log for events after a given id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// Exactly the events with id greater than the requested one.
    Events(Vec<Event>),

    /// The requested position predates the retained window.
    ///
    /// `events` holds the whole retained window; the consumer must be
    /// told that events between `requested_after` and `first_available`
    /// were lost.
    Gap {
        requested_after: u64,
        first_available: u64,
        events: Vec<Event>,
    },
}

impl Replay {
    /// Returns the events regardless of whether a gap was reported.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        match self {
            Self::Events(events) | Self::Gap { events, .. } => events,
        }
    }

    /// Consumes the replay, returning its events.
    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        match self {
            Self::Events(events) | Self::Gap { events, .. } => events,
        }
    }

    #[must_use]
    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }
}

// ============================================================================
// Event Log
// ============================================================================

/// Bounded, ordered buffer of session events with replay-from-id.
///
/// Uses a ring buffer (VecDeque) with O(1) append and eviction. Because
/// ids are contiguous inside the retained window, the start of a replay
/// is found by offset rather than by search.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: VecDeque<Event>,
    capacity: usize,
    next_id: u64,
    evicted: u64,
    exit_recorded: bool,
}

impl EventLog {
    /// Creates an empty log retaining at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
            evicted: 0,
            exit_recorded: false,
        }
    }

    /// Appends an event and returns its id.
    ///
    /// Evicts the oldest event once the log is full. Appends after an
    /// EXIT event are still accepted so that no late output is dropped
    /// silently, but callers record EXIT last.
    pub fn append(&mut self, kind: EventKind, payload: EventPayload) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);

        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.evicted = self.evicted.saturating_add(1);
        }

        if kind == EventKind::Exit {
            self.exit_recorded = true;
        }

        self.events.push_back(Event {
            id,
            kind,
            payload,
            timestamp: Utc::now(),
        });

        id
    }

    /// Appends stdout bytes.
    pub fn append_output(&mut self, bytes: Vec<u8>) -> u64 {
        self.append(EventKind::Output, EventPayload::Data(bytes))
    }

    /// Appends stderr bytes.
    pub fn append_error(&mut self, bytes: Vec<u8>) -> u64 {
        self.append(EventKind::Error, EventPayload::Data(bytes))
    }

    /// Appends the terminal EXIT event.
    pub fn append_exit(&mut self, exit: ExitInfo) -> u64 {
        self.append(EventKind::Exit, EventPayload::Exit(exit))
    }

    /// Returns all retained events with id greater than `last_id`.
    ///
    /// A `last_id` at or past the newest id yields an empty replay. A
    /// `last_id` older than the retained window yields [`Replay::Gap`].
    #[must_use]
    pub fn range_from(&self, last_id: u64) -> Replay {
        let Some(oldest) = self.oldest_id() else {
            return Replay::Events(Vec::new());
        };

        if last_id.saturating_add(1) < oldest {
            return Replay::Gap {
                requested_after: last_id,
                first_available: oldest,
                events: self.events.iter().cloned().collect(),
            };
        }

        let skip = usize::try_from(last_id.saturating_add(1).saturating_sub(oldest))
            .unwrap_or(usize::MAX);
        Replay::Events(self.events.iter().skip(skip).cloned().collect())
    }

    /// Id of the oldest retained event.
    #[must_use]
    pub fn oldest_id(&self) -> Option<u64> {
        self.events.front().map(|e| e.id)
    }

    /// Id of the newest event ever appended (0 when empty).
    #[must_use]
    pub fn newest_id(&self) -> u64 {
        self.next_id.saturating_sub(1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events dropped from the front so far.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Returns true once an EXIT event has been appended.
    #[must_use]
    pub fn has_exit(&self) -> bool {
        self.exit_recorded
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}
