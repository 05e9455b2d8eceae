// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-agent activity log backing the log resource.
//!
//! A bounded ring: once `capacity` entries are held, the oldest entry is
//! dropped for each new one. This is operator-facing history, separate from
//! the process-wide `tracing` output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.message
        )
    }
}

pub struct AgentLog {
    agent: String,
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl AgentLog {
    pub fn new(agent: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            agent: agent.into(),
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        // A panic while holding the lock cannot leave the ring inconsistent.
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.append(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Entries rendered as text lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.entries().iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let log = AgentLog::new("publish", 10);
        assert!(log.is_empty());

        log.info("agent started");
        log.warn("endpoint slow");
        log.error("delivery failed");

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[2].message, "delivery failed");
        assert!(log.lines()[1].contains("[WARN] endpoint slow"));
        assert_eq!(log.agent(), "publish");
    }

    #[test]
    fn test_ring_drops_oldest() {
        let log = AgentLog::new("publish", 3);
        for i in 0..5 {
            log.info(format!("entry {}", i));
        }

        let messages: Vec<_> = log.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let log = AgentLog::new("publish", 0);
        log.info("a");
        log.info("b");
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].message, "b");
    }

    #[test]
    fn test_entry_serializes_uppercase_level() {
        let log = AgentLog::new("publish", 1);
        log.error("boom");
        let json = serde_json::to_string(&log.entries()[0]).unwrap();
        assert!(json.contains("\"ERROR\""));
    }
}
