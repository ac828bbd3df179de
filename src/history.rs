//! Rip history persistence.
//!
//! Finished jobs are appended to a JSONL file, one record per line.
//! Reads walk the whole file; rip volumes are small enough that an index
//! is not worth having.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::job::{RipJob, RipStatus};
use crate::makemkv::DiscType;

/// One finished (or cancelled) rip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub disc_label: String,
    pub disc_type: DiscType,
    pub status: RipStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub poster_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_str: Option<String>,
    #[serde(default)]
    pub size_gb: f64,
    pub needs_review: bool,
    pub duration_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_job(job: &RipJob) -> Self {
        Self {
            id: job.id.clone(),
            disc_label: job.disc_label.clone(),
            disc_type: job.disc_type,
            status: job.status,
            title: job.identified_title.clone(),
            external_id: job.external_id.clone(),
            poster_url: job.poster_url.clone(),
            runtime_str: job.runtime_str.clone(),
            size_gb: job.size_gb,
            needs_review: job.needs_review,
            duration_seconds: job.elapsed_seconds(),
            error: job.error.as_ref().map(|e| e.format_message()),
            finished_at: job.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Append-only JSONL history store.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one entry.
    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        debug!(id = %entry.id, status = %entry.status, "Recorded rip in history");
        Ok(())
    }

    /// The most recent `limit` entries, newest first. Unparseable lines
    /// are skipped with a warning.
    pub async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries: Vec<HistoryEntry> = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping corrupt history line"),
            }
        }
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            disc_label: "DISC".to_string(),
            disc_type: DiscType::Dvd,
            status: RipStatus::Complete,
            title: Some("Some Movie".to_string()),
            external_id: Some("603".to_string()),
            poster_url: None,
            runtime_str: Some("112m".to_string()),
            size_gb: 24.6,
            needs_review: false,
            duration_seconds: 1800,
            error: None,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store.append(&entry("a")).await.unwrap();
        store.append(&entry("b")).await.unwrap();
        store.append(&entry("c")).await.unwrap();

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "c");
        assert_eq!(recent[1].id, "b");
        assert_eq!(recent[0].external_id.as_deref(), Some("603"));
        assert_eq!(recent[0].runtime_str.as_deref(), Some("112m"));
        assert_eq!(recent[0].size_gb, 24.6);
    }

    #[tokio::test]
    async fn test_recent_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("none.jsonl"));
        assert!(store.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = HistoryStore::new(path.clone());
        store.append(&entry("a")).await.unwrap();
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap()
            .write_all(b"{not json}\n")
            .await
            .unwrap();
        store.append(&entry("b")).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "b");
    }
}
