use crate::shared::ids::StepId;
use crate::shared::logging::now_secs;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Default number of events a cursor may lag behind the head before older
/// entries are dropped from its view and the gap flag is raised.
pub const DEFAULT_CURSOR_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventPayload {
    StepStatusChanged {
        from: String,
        to: String,
    },
    Message {
        text: String,
    },
    ApprovalRequested {
        request_id: u64,
        approval_kind: String,
        subject: String,
    },
    ApprovalResolved {
        request_id: u64,
        decision: String,
        auto: bool,
        timed_out: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub sequence: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub step_id: Option<String>,
    pub payload: EventPayload,
}

#[derive(Debug, Default)]
struct StreamInner {
    log: Vec<Event>,
}

/// Single ordered append-only event log with independent read cursors.
/// Publishing appends and returns immediately; it never waits on consumers.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    inner: Arc<Mutex<StreamInner>>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, step_id: Option<&StepId>, payload: EventPayload) -> Event {
        let mut inner = self.inner.lock().expect("event stream lock");
        let event = Event {
            sequence: inner.log.len() as u64,
            timestamp: now_secs(),
            step_id: step_id.map(|id| id.to_string()),
            payload,
        };
        inner.log.push(event.clone());
        event
    }

    /// New cursor positioned at the current head: only events published
    /// after this call are visible.
    pub fn subscribe(&self) -> EventCursor {
        self.subscribe_bounded(DEFAULT_CURSOR_CAPACITY)
    }

    pub fn subscribe_bounded(&self, capacity: usize) -> EventCursor {
        let position = self.inner.lock().expect("event stream lock").log.len();
        EventCursor {
            inner: Arc::clone(&self.inner),
            position,
            capacity: capacity.max(1),
            gap: false,
        }
    }

    /// New cursor that replays the full history from the first event.
    pub fn subscribe_with_replay(&self) -> EventCursor {
        EventCursor {
            inner: Arc::clone(&self.inner),
            position: 0,
            capacity: usize::MAX,
            gap: false,
        }
    }

    pub fn published_count(&self) -> usize {
        self.inner.lock().expect("event stream lock").log.len()
    }
}

#[derive(Debug)]
pub struct EventCursor {
    inner: Arc<Mutex<StreamInner>>,
    position: usize,
    capacity: usize,
    gap: bool,
}

impl EventCursor {
    /// Drains every unread event in publish order. A cursor that has fallen
    /// further behind than its capacity skips ahead to the newest `capacity`
    /// entries and flags the gap.
    pub fn poll(&mut self) -> Vec<Event> {
        let inner = self.inner.lock().expect("event stream lock");
        let head = inner.log.len();
        if head.saturating_sub(self.position) > self.capacity {
            self.position = head - self.capacity;
            self.gap = true;
        }
        let drained = inner.log[self.position..head].to_vec();
        self.position = head;
        drained
    }

    /// Returns whether events were dropped since the last call, clearing
    /// the flag.
    pub fn take_gap(&mut self) -> bool {
        std::mem::take(&mut self.gap)
    }
}
