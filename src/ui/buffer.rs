use std::collections::VecDeque;

use crate::ui::logs::LogEntry;

/// Bounded log history. The oldest entry is evicted once full.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The last `n` entries, optionally for one service only, oldest first.
    pub fn tail(&self, service: Option<&str>, n: usize) -> Vec<LogEntry> {
        let mut out: Vec<LogEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| service.map_or(true, |s| e.service_id == s))
            .take(n)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
