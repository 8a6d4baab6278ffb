//! Session log: what happened during a run, for display and debugging.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single entry in the session log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLogEntry {
    pub timestamp: DateTime<Utc>,

    pub entry_type: LogEntryType,

    /// Content of the entry, truncated for readability
    pub content: String,
}

/// Types of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    /// Text the model produced alongside a function call
    Thinking,
    ToolCall,
    ToolResult,
    /// Final answer
    Response,
    Error,
}

/// Append-only log that mirrors each entry to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    entries: Vec<SessionLogEntry>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry_type: LogEntryType, content: impl Into<String>) {
        let content = content.into();
        match entry_type {
            LogEntryType::Error => tracing::warn!(kind = ?entry_type, "{}", content),
            LogEntryType::Thinking => tracing::debug!(kind = ?entry_type, "{}", content),
            _ => tracing::info!(kind = ?entry_type, "{}", content),
        }
        self.entries.push(SessionLogEntry {
            timestamp: Utc::now(),
            entry_type,
            content,
        });
    }

    pub fn entries(&self) -> &[SessionLogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<SessionLogEntry> {
        self.entries
    }
}

/// Truncate a string for logging purposes.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... [truncated]", &s[..idx]),
        None => s.to_string(),
    }
}
