use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::session::Direction;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryEntry {
    pub user_id: String,
    pub display_name: String,
    pub timestamp: DateTime<Local>,
    pub direction: Direction,
    pub duration_seconds: u64,
}

impl CallHistoryEntry {
    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }
}

pub trait HistoryRecorder: Send + Sync {
    fn append(&self, entry: CallHistoryEntry);
}

/// Последние звонки, новые сверху, не больше `limit` записей.
///
/// Persisting to disk is the host's job; `to_json`/`load_json` give it the
/// serialized form.
pub struct MemoryHistory {
    limit: usize,
    entries: Mutex<VecDeque<CallHistoryEntry>>,
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl MemoryHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn entries(&self) -> Vec<CallHistoryEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.lock())
    }

    /// Replaces the contents with a stored list. A corrupt blob yields an
    /// empty history and a warning.
    pub fn load_json(&self, raw: &str) {
        let loaded = match serde_json::from_str::<VecDeque<CallHistoryEntry>>(raw) {
            Ok(list) => list,
            Err(e) => {
                warn!("call history unreadable, starting empty: {e}");
                VecDeque::new()
            }
        };
        let mut entries = self.lock();
        *entries = loaded;
        entries.truncate(self.limit);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<CallHistoryEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl HistoryRecorder for MemoryHistory {
    fn append(&self, entry: CallHistoryEntry) {
        info!(
            "history: {} {} ({}s, {:?})",
            entry.user_id, entry.display_name, entry.duration_seconds, entry.direction
        );
        let mut entries = self.lock();
        entries.push_front(entry);
        entries.truncate(self.limit);
    }
}
