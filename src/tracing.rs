//! State-transition tracing.
//!
//! A ring buffer of recent transitions, queryable with the `eventlog`
//! command to understand what the manager did and why.

use std::collections::VecDeque;

use serde::Serialize;

use crate::conn::WindowHandle;

/// Maximum number of entries to keep in the trace buffer
const DEFAULT_MAX_ENTRIES: usize = 500;

/// A state transition worth recording
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    WindowManaged {
        window: WindowHandle,
        number: u32,
    },
    WindowWithdrawn {
        window: WindowHandle,
    },
    WindowDestroyed {
        window: WindowHandle,
    },
    FocusChanged {
        from: Option<WindowHandle>,
        to: WindowHandle,
    },
    FrameReassigned {
        window: Option<WindowHandle>,
    },
    CommandExecuted {
        command: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub sequence: u64,
    #[serde(flatten)]
    pub transition: Transition,
}

/// Ring buffer of recent transitions
pub struct EventTracer {
    entries: VecDeque<TraceEntry>,
    max_entries: usize,
    sequence: u64,
}

impl EventTracer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
            sequence: 0,
        }
    }

    pub fn trace(&mut self, transition: Transition) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.sequence += 1;
        self.entries.push_back(TraceEntry { sequence: self.sequence, transition });
    }

    /// The last `n` entries as JSON lines.
    pub fn dump_last(&self, n: usize) -> String {
        let start = self.entries.len().saturating_sub(n);
        self.entries
            .iter()
            .skip(start)
            .map(|e| serde_json::to_string(e).unwrap_or_else(|_| "{}".to_string()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EventTracer {
    fn default() -> Self {
        Self::new()
    }
}
