//! Rip job state model.
//!
//! A job moves forward through [`RipStatus`] states and carries a fixed
//! eight-step checklist that the UI renders as a progress list. Steps are
//! keyed by [`StepId`] rather than free-form strings so a typo cannot
//! create a ninth step.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use uuid::Uuid;

use crate::classify::RipFailure;
use crate::error::{Error, Result};
use crate::identify::MediaType;
use crate::makemkv::DiscType;

/// Overall state of a rip job. Jobs only move forward, except that
/// `Error` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RipStatus {
    Idle,
    Detecting,
    Scanning,
    Ripping,
    Identifying,
    Moving,
    Complete,
    Error,
}

impl RipStatus {
    fn order(self) -> u8 {
        match self {
            RipStatus::Idle => 0,
            RipStatus::Detecting => 1,
            RipStatus::Scanning => 2,
            RipStatus::Ripping => 3,
            RipStatus::Identifying => 4,
            RipStatus::Moving => 5,
            RipStatus::Complete => 6,
            RipStatus::Error => 7,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, RipStatus::Complete | RipStatus::Error)
    }

    /// Whether a new job may be started while a job in this state holds
    /// the slot.
    pub fn allows_new_rip(self) -> bool {
        matches!(self, RipStatus::Idle | RipStatus::Complete | RipStatus::Error)
    }

    /// Whether `next` is a legal transition from this state.
    pub fn can_transition_to(self, next: RipStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RipStatus::Error {
            return true;
        }
        next.order() > self.order() && next != RipStatus::Error
    }
}

/// Identifier for one entry in the fixed step checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StepId {
    Insert,
    Detect,
    Scan,
    Rip,
    Identify,
    Library,
    Move,
    ScanPlex,
}

/// State of a single checklist step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Active,
    Complete,
    Error,
}

/// One checklist entry: a status plus an optional free-form detail such
/// as `"3/5"` or `"Skipped (needs review)"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Step {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

/// The fixed eight-step checklist. Serializes as an ordered map with
/// stable wire names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepChecklist {
    pub insert: Step,
    pub detect: Step,
    pub scan: Step,
    pub rip: Step,
    pub identify: Step,
    pub library: Step,
    #[serde(rename = "move")]
    pub relocate: Step,
    #[serde(rename = "scan-plex")]
    pub scan_plex: Step,
}

impl StepChecklist {
    pub fn get(&self, id: StepId) -> &Step {
        match id {
            StepId::Insert => &self.insert,
            StepId::Detect => &self.detect,
            StepId::Scan => &self.scan,
            StepId::Rip => &self.rip,
            StepId::Identify => &self.identify,
            StepId::Library => &self.library,
            StepId::Move => &self.relocate,
            StepId::ScanPlex => &self.scan_plex,
        }
    }

    pub fn get_mut(&mut self, id: StepId) -> &mut Step {
        match id {
            StepId::Insert => &mut self.insert,
            StepId::Detect => &mut self.detect,
            StepId::Scan => &mut self.scan,
            StepId::Rip => &mut self.rip,
            StepId::Identify => &mut self.identify,
            StepId::Library => &mut self.library,
            StepId::Move => &mut self.relocate,
            StepId::ScanPlex => &mut self.scan_plex,
        }
    }

    pub fn set(&mut self, id: StepId, status: StepStatus) {
        let step = self.get_mut(id);
        step.status = status;
        step.detail = None;
    }

    pub fn set_with_detail(&mut self, id: StepId, status: StepStatus, detail: impl Into<String>) {
        let step = self.get_mut(id);
        step.status = status;
        step.detail = Some(detail.into());
    }

    /// Mark whichever step is currently active as failed.
    pub fn fail_active(&mut self) {
        use strum::IntoEnumIterator;
        for id in StepId::iter() {
            if self.get(id).status == StepStatus::Active {
                self.get_mut(id).status = StepStatus::Error;
            }
        }
    }
}

/// Tracks which progress milestones (25/50/75) have already been
/// announced. Progress reports can jitter backwards; the high-water mark
/// makes each announcement fire at most once.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MilestoneTracker {
    high_water: f64,
}

impl MilestoneTracker {
    pub const MILESTONES: [u8; 3] = [25, 50, 75];

    /// Record a progress report and return any milestones newly crossed.
    pub fn advance(&mut self, pct: f64) -> Vec<u8> {
        if pct <= self.high_water {
            return Vec::new();
        }
        let crossed = Self::MILESTONES
            .iter()
            .copied()
            .filter(|&m| self.high_water < f64::from(m) && pct >= f64::from(m))
            .collect();
        self.high_water = pct;
        crossed
    }
}

/// A rip job: one disc, one slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RipJob {
    pub id: String,
    pub device: String,
    pub disc_label: String,
    pub disc_type: DiscType,
    pub status: RipStatus,
    pub steps: StepChecklist,
    pub progress_pct: f64,
    pub current_size_bytes: u64,
    pub expected_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rip_output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identified_title: Option<String>,
    /// Media type declared by the caller; overrides the duration
    /// heuristic when set.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub requested_media_type: Option<MediaType>,
    /// Season number supplied by the caller for TV rips.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub season: Option<u32>,
    /// Track indices picked by the caller from a prior scan. Empty means
    /// the pipeline selects tracks itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_tracks: Vec<u32>,
    /// Files produced so far, in staging order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ripped_files: Vec<PathBuf>,
    pub needs_review: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<RipFailure>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Episode counters, only meaningful for TV discs.
    #[serde(default)]
    pub episodes_total: u32,
    #[serde(default)]
    pub episodes_completed: u32,
    /// Per-episode failure summaries for partially successful TV rips.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub episode_errors: Vec<String>,
    /// Enrichment from identification, carried into history.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub poster_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_str: Option<String>,
    #[serde(default)]
    pub size_gb: f64,
    /// Guards the status-poll handoff so post-processing spawns once.
    #[serde(skip)]
    pub post_processing_started: bool,
}

impl RipJob {
    pub fn new(device: impl Into<String>) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            device: device.into(),
            disc_label: String::new(),
            disc_type: DiscType::Unknown,
            status: RipStatus::Detecting,
            steps: StepChecklist::default(),
            progress_pct: 0.0,
            current_size_bytes: 0,
            expected_size_bytes: 0,
            rip_output_dir: None,
            identified_title: None,
            requested_media_type: None,
            season: None,
            selected_tracks: Vec::new(),
            ripped_files: Vec::new(),
            needs_review: false,
            error: None,
            message: None,
            started_at: Utc::now(),
            finished_at: None,
            episodes_total: 0,
            episodes_completed: 0,
            episode_errors: Vec::new(),
            external_id: None,
            poster_url: None,
            runtime_str: None,
            size_gb: 0.0,
            post_processing_started: false,
        }
    }

    /// Advance to `next`, rejecting backwards or out-of-terminal moves.
    pub fn set_status(&mut self, next: RipStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a classified failure and move to the error state.
    pub fn fail(&mut self, failure: RipFailure) {
        self.message = Some(failure.format_message());
        self.error = Some(failure);
        self.steps.fail_active();
        if !self.status.is_terminal() {
            self.status = RipStatus::Error;
        }
        self.finished_at = Some(Utc::now());
    }

    pub fn set_progress(&mut self, pct: f64) {
        self.progress_pct = pct.clamp(0.0, 100.0);
    }

    /// Whether the job got far enough to be worth keeping in history.
    pub fn made_progress(&self) -> bool {
        !self.disc_label.is_empty() || self.progress_pct > 0.0
    }

    pub fn elapsed_seconds(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        let mut job = RipJob::new("/dev/sr0");
        assert_eq!(job.status, RipStatus::Detecting);
        job.set_status(RipStatus::Scanning).unwrap();
        job.set_status(RipStatus::Ripping).unwrap();
        assert!(job.set_status(RipStatus::Scanning).is_err());
        job.set_status(RipStatus::Complete).unwrap();
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_error_reachable_from_any_nonterminal() {
        for status in [
            RipStatus::Idle,
            RipStatus::Detecting,
            RipStatus::Scanning,
            RipStatus::Ripping,
            RipStatus::Identifying,
            RipStatus::Moving,
        ] {
            assert!(status.can_transition_to(RipStatus::Error), "{status}");
        }
        assert!(!RipStatus::Complete.can_transition_to(RipStatus::Error));
        assert!(!RipStatus::Error.can_transition_to(RipStatus::Ripping));
    }

    #[test]
    fn test_new_rip_gating() {
        assert!(RipStatus::Idle.allows_new_rip());
        assert!(RipStatus::Complete.allows_new_rip());
        assert!(RipStatus::Error.allows_new_rip());
        assert!(!RipStatus::Ripping.allows_new_rip());
        assert!(!RipStatus::Moving.allows_new_rip());
    }

    #[test]
    fn test_milestones_fire_once_under_jitter() {
        let mut tracker = MilestoneTracker::default();
        assert_eq!(tracker.advance(10.0), Vec::<u8>::new());
        assert_eq!(tracker.advance(26.0), vec![25]);
        // Jitter backwards, then forwards again: no repeat
        assert_eq!(tracker.advance(24.0), Vec::<u8>::new());
        assert_eq!(tracker.advance(27.0), Vec::<u8>::new());
        assert_eq!(tracker.advance(80.0), vec![50, 75]);
        assert_eq!(tracker.advance(99.0), Vec::<u8>::new());
    }

    #[test]
    fn test_step_wire_names_and_order() {
        let mut steps = StepChecklist::default();
        steps.set(StepId::Insert, StepStatus::Complete);
        steps.set_with_detail(StepId::ScanPlex, StepStatus::Complete, "Skipped (needs review)");
        let json = serde_json::to_string(&steps).unwrap();
        let keys: Vec<&str> = [
            "insert", "detect", "scan", "rip", "identify", "library", "move", "scan-plex",
        ]
        .to_vec();
        let mut last = 0;
        for key in &keys {
            let pos = json.find(&format!("\"{}\"", key)).unwrap();
            assert!(pos >= last, "step {} out of order", key);
            last = pos;
        }
        assert!(json.contains("Skipped (needs review)"));
    }

    #[test]
    fn test_fail_marks_active_step() {
        let mut job = RipJob::new("/dev/sr0");
        job.steps.set(StepId::Rip, StepStatus::Active);
        job.fail(crate::classify::RipFailure::new(
            crate::classify::ErrorCode::BadSector,
            "bad sector",
        ));
        assert_eq!(job.status, RipStatus::Error);
        assert_eq!(job.steps.get(StepId::Rip).status, StepStatus::Error);
        assert!(job.message.as_deref().unwrap_or("").starts_with("[DISC]"));
    }

    #[test]
    fn test_short_job_id() {
        let job = RipJob::new("/dev/sr0");
        assert_eq!(job.id.len(), 8);
        assert!(job.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_progress_clamped() {
        let mut job = RipJob::new("/dev/sr0");
        job.set_progress(142.0);
        assert_eq!(job.progress_pct, 100.0);
        job.set_progress(-3.0);
        assert_eq!(job.progress_pct, 0.0);
    }
}
