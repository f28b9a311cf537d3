// ── Bounded history of recent errors ──

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    /// Command name that produced the error, if any.
    pub command: Option<String>,
    pub message: String,
}

/// Ring buffer of the most recent errors; the oldest entry is evicted
/// once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct ErrorRing {
    entries: VecDeque<ErrorEntry>,
    capacity: usize,
}

impl ErrorRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: ErrorEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn record(&mut self, command: Option<&str>, message: impl Into<String>) {
        self.push(ErrorEntry {
            timestamp: Utc::now(),
            command: command.map(str::to_owned),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }
}
