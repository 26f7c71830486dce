//! Per-operation trace buffer.
//!
//! Collects timestamped notes over an operation's lifetime for inclusion
//! in failure reports and slow-operation dumps. Bounded; oldest entries
//! are dropped first. Cleared when the operation finalizes.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::Instant;

use parking_lot::Mutex;

const DEFAULT_TRACE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct TraceEvent {
    at: Instant,
    message: String,
}

/// Bounded, thread-safe trace recorder.
#[derive(Debug)]
pub struct TraceBuffer {
    started: Instant,
    events: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TRACE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            started: Instant::now(),
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record a note. Drops the oldest entry when full.
    pub fn record(&self, message: impl Into<String>) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(TraceEvent {
            at: Instant::now(),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Render all entries, one per line, with offsets from trace creation.
    pub fn dump(&self) -> String {
        let events = self.events.lock();
        let mut out = String::new();
        for event in events.iter() {
            let offset_us = event.at.duration_since(self.started).as_micros();
            let _ = writeln!(out, "[+{offset_us}us] {}", event.message);
        }
        out
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new()
    }
}
