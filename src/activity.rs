//! Admin activity log: newest-first ring buffer persisted after every append.

use crate::clock::now_millis;
use crate::storage::{KeyValueStore, LOGS_SLOT, read_json, write_json};
use crate::types::{LogEntry, LogKind, new_id};
use std::collections::VecDeque;
use std::sync::Arc;

pub const LOG_CAPACITY: usize = 1000;

pub struct ActivityLog {
    storage: Arc<dyn KeyValueStore>,
    /// Newest first.
    entries: VecDeque<LogEntry>,
}

impl ActivityLog {
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let mut entries: VecDeque<LogEntry> =
            read_json(storage.as_ref(), LOGS_SLOT).unwrap_or_default();
        entries.truncate(LOG_CAPACITY);
        Self { storage, entries }
    }

    /// Appends an entry, evicting the oldest once the log holds [`LOG_CAPACITY`].
    pub fn record(&mut self, kind: LogKind, details: &str, user_email: Option<&str>) -> LogEntry {
        let entry = LogEntry {
            id: new_id("log"),
            timestamp: now_millis(),
            kind,
            details: details.to_string(),
            user_email: user_email.map(str::to_string),
        };
        self.entries.push_front(entry.clone());
        self.entries.truncate(LOG_CAPACITY);
        write_json(self.storage.as_ref(), LOGS_SLOT, &self.entries);
        entry
    }

    /// Newest first.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
