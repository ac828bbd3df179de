//! Job snapshot persistence and crash recovery.
//!
//! While a rip runs, a small snapshot of the job is written to a fixed
//! path on every status transition. On startup the snapshot (plus a look
//! at the process table and the rip output on disk) decides whether the
//! interrupted job is still running, finished enough to resume
//! post-processing, or stale and discarded.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::job::{RipJob, RipStatus};
use crate::makemkv::{DiscType, LiveRip};

/// Persisted slice of an in-flight job, enough to pick it back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub disc_label: String,
    pub disc_type: DiscType,
    pub device: String,
    pub status: RipStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identified_title: Option<String>,
    pub expected_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rip_output_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn from_job(job: &RipJob) -> Self {
        Self {
            id: job.id.clone(),
            disc_label: job.disc_label.clone(),
            disc_type: job.disc_type,
            device: job.device.clone(),
            status: job.status,
            identified_title: job.identified_title.clone(),
            expected_size_bytes: job.expected_size_bytes,
            rip_output_dir: job.rip_output_dir.clone(),
            started_at: job.started_at,
        }
    }
}

/// Reads and writes the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn save(&self, snapshot: &JobSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&self.path, contents).await?;
        debug!(id = %snapshot.id, status = %snapshot.status, "Saved job snapshot");
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<JobSnapshot>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable job snapshot");
                Ok(None)
            }
        }
    }

    pub async fn clear(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Cleared job snapshot"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to clear job snapshot"),
        }
    }
}

/// What startup recovery decided to do with an interrupted job.
#[derive(Debug, Clone)]
pub enum RecoveryPlan {
    /// makemkvcon is still running; re-attach to it.
    AdoptLiveRip {
        snapshot: JobSnapshot,
        output_dir: Option<PathBuf>,
    },
    /// The rip finished (or close enough); run post-processing.
    ResumePostProcessing { snapshot: JobSnapshot },
    /// Nothing worth saving.
    Discard,
}

/// Decide what to do with a leftover snapshot.
///
/// `on_disk_bytes` is the current size of the rip output directory;
/// `threshold_pct` is the completion percentage at which an orphaned
/// output counts as done.
pub fn plan_recovery(
    snapshot: JobSnapshot,
    live: Option<&LiveRip>,
    on_disk_bytes: u64,
    threshold_pct: u8,
) -> RecoveryPlan {
    if let Some(live) = live {
        info!(pid = live.pid, id = %snapshot.id, "Found live makemkvcon, adopting rip");
        let output_dir = live
            .output_dir
            .clone()
            .or_else(|| snapshot.rip_output_dir.clone());
        return RecoveryPlan::AdoptLiveRip {
            snapshot,
            output_dir,
        };
    }

    if snapshot.expected_size_bytes > 0 {
        let pct = on_disk_bytes as f64 / snapshot.expected_size_bytes as f64 * 100.0;
        if pct >= f64::from(threshold_pct) {
            info!(
                id = %snapshot.id,
                pct = format!("{:.1}", pct),
                "Rip output looks complete, resuming post-processing"
            );
            return RecoveryPlan::ResumePostProcessing { snapshot };
        }
        info!(
            id = %snapshot.id,
            pct = format!("{:.1}", pct),
            "Rip output incomplete, discarding snapshot"
        );
    }
    RecoveryPlan::Discard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> JobSnapshot {
        JobSnapshot {
            id: "abc12345".to_string(),
            disc_label: "THE_MOVIE".to_string(),
            disc_type: DiscType::Bluray,
            device: "/dev/sr0".to_string(),
            status: RipStatus::Ripping,
            identified_title: None,
            expected_size_bytes: 1000,
            rip_output_dir: Some(PathBuf::from("/data/raw/THE_MOVIE")),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_load_clear_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("current_job.json"));
        assert!(store.load().await.unwrap().is_none());

        store.save(&snapshot()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.id, "abc12345");
        assert_eq!(loaded.status, RipStatus::Ripping);

        store.clear().await;
        assert!(store.load().await.unwrap().is_none());
        // Clearing twice is fine
        store.clear().await;
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current_job.json");
        tokio::fs::write(&path, "{broken").await.unwrap();
        let store = SnapshotStore::new(path);
        assert!(store.load().await.unwrap().is_none());
    }

    #[test]
    fn test_live_process_wins() {
        let live = LiveRip {
            pid: 4242,
            output_dir: Some(PathBuf::from("/data/raw/FROM_CMDLINE")),
        };
        match plan_recovery(snapshot(), Some(&live), 0, 90) {
            RecoveryPlan::AdoptLiveRip { output_dir, .. } => {
                assert_eq!(output_dir, Some(PathBuf::from("/data/raw/FROM_CMDLINE")));
            }
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[test]
    fn test_complete_enough_resumes_post_processing() {
        match plan_recovery(snapshot(), None, 900, 90) {
            RecoveryPlan::ResumePostProcessing { snapshot } => {
                assert_eq!(snapshot.id, "abc12345");
            }
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_output_is_discarded() {
        assert!(matches!(
            plan_recovery(snapshot(), None, 899, 90),
            RecoveryPlan::Discard
        ));
    }

    #[test]
    fn test_zero_expected_size_is_discarded() {
        let mut snap = snapshot();
        snap.expected_size_bytes = 0;
        assert!(matches!(
            plan_recovery(snap, None, 500, 90),
            RecoveryPlan::Discard
        ));
    }
}
