//! In-memory activity feed.
//!
//! A capped list of recent human-readable events, served by the API so
//! the frontend can show what the ripper has been doing. Events also go
//! through `tracing` so they land in the log files.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{error, info, warn};

/// Maximum number of retained events.
const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Warning,
    Error,
}

/// One activity feed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub level: ActivityLevel,
    pub message: String,
}

/// Capped, thread-safe activity feed.
#[derive(Debug, Default)]
pub struct ActivityLog {
    events: Mutex<VecDeque<ActivityEvent>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, level: ActivityLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            ActivityLevel::Info => info!(target: "autorip::activity", "{}", message),
            ActivityLevel::Warning => warn!(target: "autorip::activity", "{}", message),
            ActivityLevel::Error => error!(target: "autorip::activity", "{}", message),
        }
        let mut events = self.events.lock();
        events.push_back(ActivityEvent {
            timestamp: Utc::now(),
            level,
            message,
        });
        while events.len() > MAX_EVENTS {
            events.pop_front();
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(ActivityLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.record(ActivityLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(ActivityLevel::Error, message);
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEvent> {
        let events = self.events.lock();
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_is_newest_first() {
        let log = ActivityLog::new();
        log.info("first");
        log.warning("second");
        log.error("third");
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "third");
        assert_eq!(recent[0].level, ActivityLevel::Error);
        assert_eq!(recent[1].message, "second");
    }

    #[test]
    fn test_cap() {
        let log = ActivityLog::new();
        for i in 0..(MAX_EVENTS + 50) {
            log.info(format!("event {}", i));
        }
        assert_eq!(log.len(), MAX_EVENTS);
        // Oldest entries were dropped
        let recent = log.recent(MAX_EVENTS);
        assert_eq!(recent.last().map(|e| e.message.as_str()), Some("event 50"));
    }
}
