use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub level: String,
    pub message: String,
}

/// The most recent log records, for showing to a user on request.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    records: Mutex<VecDeque<LogRecord>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        LogBuffer::new(DEFAULT_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, record: LogRecord) {
        let mut records = self.records.lock().expect("mutex poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        if self.capacity > 0 {
            records.push_back(record);
        }
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .expect("mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
