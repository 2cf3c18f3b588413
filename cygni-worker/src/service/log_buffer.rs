//! Log buffer service
//!
//! Collects build output between sends. Executors write to the buffer as
//! lines arrive; the log sender drains it on a fixed interval.

use cygni_core::domain::log::LogEntry;
use std::sync::{Arc, Mutex, PoisonError};

/// Buffer of log entries awaiting delivery to the orchestrator
pub trait LogBufferService: Send + Sync {
    fn add_entry(&self, entry: LogEntry);

    /// Returns all buffered entries and clears the buffer
    fn drain(&self) -> Vec<LogEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory implementation of LogBufferService
#[derive(Clone, Default)]
pub struct InMemoryLogBuffer {
    buffer: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogBufferService for InMemoryLogBuffer {
    fn add_entry(&self, entry: LogEntry) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn drain(&self) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cygni_core::domain::log::LogLevel;

    #[test]
    fn test_drain_empties_buffer_in_order() {
        let buffer = InMemoryLogBuffer::new();
        buffer.add_entry(LogEntry::new(LogLevel::Info, "STEP 1/3: FROM alpine"));
        buffer.add_entry(LogEntry::new(LogLevel::Info, "STEP 2/3: RUN make"));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message, "STEP 1/3: FROM alpine");
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_clones_share_one_buffer() {
        let buffer = InMemoryLogBuffer::new();
        let writer = buffer.clone();
        writer.add_entry(LogEntry::new(LogLevel::Warning, "cache miss"));
        assert_eq!(buffer.len(), 1);
    }
}
