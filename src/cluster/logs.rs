//! Bounded per-deployment log buffers fed by `deployment.logs` events

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use crate::protocol::LogEntry;

#[derive(Clone)]
pub struct LogStore {
    capacity: usize,
    buffers: Arc<DashMap<String, VecDeque<LogEntry>>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: Arc::new(DashMap::new()),
        }
    }

    /// Append lines, dropping the oldest beyond capacity
    pub fn append(&self, deployment_id: &str, entries: &[LogEntry]) {
        let mut buffer = self.buffers.entry(deployment_id.to_string()).or_default();
        for entry in entries {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }
    }

    /// Last `n` lines (all if `None`), oldest first
    pub fn tail(&self, deployment_id: &str, n: Option<usize>) -> Vec<LogEntry> {
        let Some(buffer) = self.buffers.get(deployment_id) else {
            return vec![];
        };
        let skip = n.map(|n| buffer.len().saturating_sub(n)).unwrap_or(0);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self, deployment_id: &str) {
        self.buffers.remove(deployment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LogLevel, LogSource};
    use chrono::Utc;

    fn line(message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            source: LogSource::Stdout,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let store = LogStore::new(3);
        store.append("d1", &[line("a"), line("b")]);
        store.append("d1", &[line("c"), line("d")]);

        let lines: Vec<_> = store
            .tail("d1", None)
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(lines, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_tail() {
        let store = LogStore::new(10);
        store.append("d1", &[line("a"), line("b"), line("c")]);

        let last: Vec<_> = store
            .tail("d1", Some(2))
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(last, vec!["b", "c"]);
        assert!(store.tail("missing", Some(5)).is_empty());

        store.clear("d1");
        assert!(store.tail("d1", None).is_empty());
    }
}
