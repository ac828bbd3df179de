//! The rip engine.
//!
//! Owns the single job slot and drives the whole pipeline: detect disc,
//! scan, rip (movie or TV flow), identify, place in the library or the
//! review area, notify the media server. The engine is also the recovery
//! point after a crash: see [`persist`].

pub mod organize;
pub mod persist;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::classify::{self, ErrorCode, RipFailure};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::history::{HistoryEntry, HistoryStore};
use crate::identify::{Identification, Identifier, IdentifyRequest, MediaType};
use crate::job::{MilestoneTracker, RipJob, RipStatus, StepId, StepStatus};
use crate::makemkv::{DiscInfo, MakeMkv, TrackInfo};
use crate::notify::LibraryNotifier;
use organize::ReviewMetadata;
use persist::{JobSnapshot, RecoveryPlan, SnapshotStore};

/// Progress is capped below this while the external tool still runs; the
/// last percent belongs to the tool finishing, not to byte counting.
const POLL_PROGRESS_CAP: f64 = 99.0;

const BYTES_PER_GB: f64 = 1_073_741_824.0;

#[derive(Debug, Default)]
struct EngineState {
    current: Option<RipJob>,
}

/// Point-in-time view of the active job for the API.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: RipJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    /// Human-readable remaining time, e.g. "12m 30s".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

/// Parameters for starting a rip.
///
/// Everything beyond the device is optional: a caller that already
/// scanned and identified the disc supplies the confirmed title, the
/// media type, and the exact tracks to rip, and the pipeline uses those
/// instead of re-deriving them.
#[derive(Debug, Clone, Default)]
pub struct RipRequest {
    pub device: Option<String>,
    /// Pre-confirmed display title; identification is skipped when set.
    pub title: Option<String>,
    pub media_type: Option<MediaType>,
    /// Season number for TV rips with a confirmed title.
    pub season: Option<u32>,
    /// Track indices to rip, from a prior scan.
    pub tracks: Vec<u32>,
}

/// Overall progress of a TV rip: completed episodes plus the fraction of
/// the one in flight, spread over the total.
fn tv_overall_progress(completed: u32, total: u32, current_track_pct: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((f64::from(completed) + current_track_pct / 100.0) / f64::from(total) * 100.0)
        .clamp(0.0, 100.0)
}

/// Estimated seconds remaining given elapsed time and progress.
fn eta_seconds(elapsed_secs: i64, pct: f64) -> Option<u64> {
    if pct < 1.0 || elapsed_secs <= 0 {
        return None;
    }
    let remaining = elapsed_secs as f64 * (100.0 - pct) / pct;
    Some(remaining.max(0.0) as u64)
}

/// Render a remaining-time estimate as display text.
fn format_eta(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Detail text shown on the rip step while a title copies.
fn rip_progress_detail(pct: f64) -> String {
    format!("{:.0}%", pct)
}

/// Episode tracks for a TV rip: the caller's selection when one was
/// supplied, otherwise every track inside the duration window.
fn pick_episode_tracks(
    disc: &DiscInfo,
    selected: &[u32],
    min_secs: u64,
    max_secs: u64,
) -> Vec<TrackInfo> {
    if selected.is_empty() {
        disc.episode_tracks(min_secs, max_secs)
            .into_iter()
            .cloned()
            .collect()
    } else {
        disc.tracks
            .iter()
            .filter(|t| selected.contains(&t.index))
            .cloned()
            .collect()
    }
}

/// The track a movie rip should take: the caller's selection when one
/// was supplied, otherwise the longest title over the threshold.
fn pick_movie_track<'a>(
    disc: &'a DiscInfo,
    selected: &[u32],
    min_secs: u64,
) -> Option<&'a TrackInfo> {
    match selected.first() {
        Some(&index) => disc.tracks.iter().find(|t| t.index == index),
        None => disc.main_feature(min_secs),
    }
}

/// The single-slot rip engine.
pub struct RipEngine {
    makemkv: MakeMkv,
    identifier: Arc<dyn Identifier>,
    notifier: Arc<dyn LibraryNotifier>,
    activity: Arc<ActivityLog>,
    history: HistoryStore,
    snapshots: SnapshotStore,
    config: AppConfig,
    state: Mutex<EngineState>,
}

impl RipEngine {
    pub fn new(
        config: AppConfig,
        identifier: Arc<dyn Identifier>,
        notifier: Arc<dyn LibraryNotifier>,
        activity: Arc<ActivityLog>,
    ) -> Arc<Self> {
        let makemkv = MakeMkv::new(
            config.ripping.makemkvcon_path.clone(),
            config.ripping.min_title_seconds,
        );
        let history = HistoryStore::new(config.history_path());
        let snapshots = SnapshotStore::new(config.snapshot_path());
        Arc::new(Self {
            makemkv,
            identifier,
            notifier,
            activity,
            history,
            snapshots,
            config,
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Start a new rip. Fails when a job is already in flight.
    pub fn start_rip(self: &Arc<Self>, request: RipRequest) -> Result<String> {
        let device = request
            .device
            .unwrap_or_else(|| self.config.ripping.device.clone());
        let job_id = {
            let mut state = self.state.lock();
            if let Some(job) = &state.current
                && !job.status.allows_new_rip()
            {
                return Err(Error::JobActive(job.id.clone()));
            }
            let mut job = RipJob::new(device);
            job.identified_title = request.title;
            job.requested_media_type = request.media_type;
            job.season = request.season;
            job.selected_tracks = request.tracks;
            job.steps.set(StepId::Insert, StepStatus::Active);
            let id = job.id.clone();
            state.current = Some(job);
            id
        };

        self.activity.info(format!("Rip {} started", job_id));
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_pipeline().await;
        });
        Ok(job_id)
    }

    /// Cancel the active job: kill the ripper, keep the attempt in
    /// history when it got anywhere, free the slot.
    pub async fn cancel(self: &Arc<Self>) -> Result<String> {
        let job = {
            let mut state = self.state.lock();
            match state.current.take() {
                Some(job) => job,
                None => return Err(Error::NoActiveJob),
            }
        };

        let killed = self.makemkv.kill_live_processes();
        if killed > 0 {
            info!(killed, "Killed ripper processes on cancel");
        }
        if job.made_progress() {
            let mut finished = job.clone();
            finished.status = RipStatus::Error;
            finished.message = Some("Cancelled".to_string());
            finished.finished_at = Some(chrono::Utc::now());
            if let Err(e) = self.history.append(&HistoryEntry::from_job(&finished)).await {
                warn!(error = %e, "Failed to record cancelled rip in history");
            }
        }
        self.snapshots.clear().await;
        self.activity
            .warning(format!("Rip {} cancelled", job.id));
        Ok(job.id)
    }

    /// Current status for polling clients.
    ///
    /// This is also where an externally finished rip gets noticed: when
    /// the ripper process is gone but its output is on disk, the rip step
    /// completes and post-processing starts, exactly once.
    pub async fn status(self: &Arc<Self>) -> Option<JobStatusView> {
        let (id, ripping, output_dir, post_started) = {
            let state = self.state.lock();
            let job = state.current.as_ref()?;
            (
                job.id.clone(),
                job.status == RipStatus::Ripping,
                job.rip_output_dir.clone(),
                job.post_processing_started,
            )
        };

        if ripping && !post_started && let Some(dir) = output_dir {
            let size = organize::dir_size_bytes(&dir).await;
            let has_output = organize::mkv_files(&dir)
                .await
                .map(|files| !files.is_empty())
                .unwrap_or(false);
            let process_alive = self.makemkv.find_live_process().is_some();

            let spawn_post = {
                let mut state = self.state.lock();
                match state.current.as_mut() {
                    Some(job) if job.id == id && job.status == RipStatus::Ripping => {
                        job.current_size_bytes = size;
                        if job.expected_size_bytes > 0 {
                            let pct = size as f64 / job.expected_size_bytes as f64 * 100.0;
                            job.set_progress(pct.min(POLL_PROGRESS_CAP));
                        }
                        if !process_alive && has_output && !job.post_processing_started {
                            job.steps.set(StepId::Rip, StepStatus::Complete);
                            job.post_processing_started = true;
                            job.set_progress(100.0);
                            true
                        } else {
                            false
                        }
                    }
                    _ => false,
                }
            };
            if spawn_post {
                info!(id = %id, "Ripper finished externally, starting post-processing");
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.post_process().await;
                });
            }
        }

        let state = self.state.lock();
        let job = state.current.as_ref()?.clone();
        let eta = if job.status == RipStatus::Ripping {
            eta_seconds(job.elapsed_seconds(), job.progress_pct)
        } else {
            None
        };
        Some(JobStatusView {
            job,
            eta_seconds: eta,
            eta: eta.map(format_eta),
        })
    }

    /// Crash recovery at startup. Safe to call when there is nothing to
    /// recover.
    pub async fn recover(self: &Arc<Self>) {
        let Ok(Some(snapshot)) = self.snapshots.load().await else {
            return;
        };
        let live = self.makemkv.find_live_process();
        let on_disk = match &snapshot.rip_output_dir {
            Some(dir) => organize::dir_size_bytes(dir).await,
            None => 0,
        };
        let threshold = self.config.ripping.completion_threshold_pct;

        match persist::plan_recovery(snapshot, live.as_ref(), on_disk, threshold) {
            RecoveryPlan::AdoptLiveRip {
                snapshot,
                output_dir,
            } => {
                self.activity.info(format!(
                    "Recovered rip {} with ripper still running",
                    snapshot.id
                ));
                let job = Self::job_from_snapshot(&snapshot, output_dir, false);
                self.state.lock().current = Some(job);
            }
            RecoveryPlan::ResumePostProcessing { snapshot } => {
                self.activity.info(format!(
                    "Recovered finished rip {}, resuming post-processing",
                    snapshot.id
                ));
                let output_dir = snapshot.rip_output_dir.clone();
                let job = Self::job_from_snapshot(&snapshot, output_dir, true);
                self.state.lock().current = Some(job);
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.post_process().await;
                });
            }
            RecoveryPlan::Discard => {
                info!("Discarding stale job snapshot");
                self.snapshots.clear().await;
            }
        }
    }

    fn job_from_snapshot(
        snapshot: &JobSnapshot,
        output_dir: Option<PathBuf>,
        rip_done: bool,
    ) -> RipJob {
        let mut job = RipJob::new(snapshot.device.clone());
        job.id = snapshot.id.clone();
        job.disc_label = snapshot.disc_label.clone();
        job.disc_type = snapshot.disc_type;
        job.identified_title = snapshot.identified_title.clone();
        job.expected_size_bytes = snapshot.expected_size_bytes;
        job.rip_output_dir = output_dir;
        job.started_at = snapshot.started_at;
        job.status = RipStatus::Ripping;
        job.steps.set(StepId::Insert, StepStatus::Complete);
        job.steps.set(StepId::Detect, StepStatus::Complete);
        job.steps.set(StepId::Scan, StepStatus::Complete);
        if rip_done {
            job.steps
                .set_with_detail(StepId::Rip, StepStatus::Complete, "(recovered)");
            job.post_processing_started = true;
            job.progress_pct = 100.0;
        } else {
            job.steps
                .set_with_detail(StepId::Rip, StepStatus::Active, "(recovered)");
        }
        job
    }

    fn with_job<T>(&self, f: impl FnOnce(&mut RipJob) -> T) -> Option<T> {
        let mut state = self.state.lock();
        state.current.as_mut().map(f)
    }

    async fn persist_snapshot(&self) {
        let snapshot = {
            let state = self.state.lock();
            state.current.as_ref().map(JobSnapshot::from_job)
        };
        if let Some(snapshot) = snapshot
            && let Err(e) = self.snapshots.save(&snapshot).await
        {
            warn!(error = %e, "Failed to persist job snapshot");
        }
    }

    /// Fail the current job with a classified failure and finalize it.
    async fn finish_with_failure(&self, failure: RipFailure) {
        self.activity.error(failure.format_message());
        let entry = self.with_job(|job| {
            job.fail(failure);
            HistoryEntry::from_job(job)
        });
        if let Some(entry) = entry
            && let Err(e) = self.history.append(&entry).await
        {
            warn!(error = %e, "Failed to record failed rip in history");
        }
        self.snapshots.clear().await;
    }

    async fn finish_complete(&self, message: String) {
        self.activity.info(message.clone());
        let entry = self.with_job(|job| {
            job.message = Some(message);
            job.progress_pct = 100.0;
            job.status = RipStatus::Complete;
            job.finished_at = Some(chrono::Utc::now());
            HistoryEntry::from_job(job)
        });
        if let Some(entry) = entry
            && let Err(e) = self.history.append(&entry).await
        {
            warn!(error = %e, "Failed to record rip in history");
        }
        self.snapshots.clear().await;
        if self.config.ripping.eject_when_done {
            let device = self
                .with_job(|job| job.device.clone())
                .unwrap_or_else(|| self.config.ripping.device.clone());
            self.makemkv.eject(&device).await;
        }
    }

    async fn classify_failure(&self, exit_code: Option<i32>, output: &[String]) -> RipFailure {
        let device = self
            .with_job(|job| job.device.clone())
            .unwrap_or_else(|| self.config.ripping.device.clone());
        classify::classify(
            exit_code,
            output,
            &device,
            &self.config.paths.raw_rips,
            self.config.ripping.required_free_bytes(),
        )
        .await
    }

    /// The main pipeline, from disc detection to a terminal state.
    async fn run_pipeline(self: Arc<Self>) {
        let device = match self.with_job(|job| job.device.clone()) {
            Some(device) => device,
            None => return,
        };

        // Detect
        if !self.makemkv.disc_present(&device) {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::NoDisc,
                format!("No disc found in {}", device),
            ))
            .await;
            return;
        }
        self.with_job(|job| {
            job.steps.set(StepId::Insert, StepStatus::Complete);
            job.steps.set(StepId::Detect, StepStatus::Complete);
            job.steps.set(StepId::Scan, StepStatus::Active);
            let _ = job.set_status(RipStatus::Scanning);
        });

        // Scan
        let disc = match self.makemkv.get_disc_info(&device).await {
            Ok(disc) => disc,
            Err(e) => {
                let failure = self.classify_failure(Some(1), &[e.to_string()]).await;
                self.finish_with_failure(failure).await;
                return;
            }
        };
        if disc.tracks.is_empty() {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::DiscRead,
                "Disc scan returned no usable titles",
            ))
            .await;
            return;
        }

        // Space gate before committing to hours of ripping
        let required = self.config.ripping.required_free_bytes();
        if let Some(available) = classify::available_space_for(&self.config.paths.raw_rips)
            && available < required
        {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::DiskFull,
                format!(
                    "Only {:.1} GB free in staging, {} GB required",
                    available as f64 / 1e9,
                    self.config.ripping.required_free_gb
                ),
            ))
            .await;
            return;
        }

        let tv_min = self.config.ripping.tv_min_episode_seconds;
        let tv_max = self.config.ripping.tv_max_episode_seconds;
        let (selected, media_hint) = self
            .with_job(|job| (job.selected_tracks.clone(), job.requested_media_type))
            .unwrap_or_default();
        // An explicit media type from the caller wins; the duration
        // heuristic only applies to unassisted rips.
        let is_tv = match media_hint {
            Some(MediaType::Tv) => true,
            Some(MediaType::Movie) => false,
            None => selected.len() >= 2 || (selected.is_empty() && disc.is_tv_disc(tv_min, tv_max)),
        };
        self.activity.info(format!(
            "Detected {} disc \"{}\" with {} titles{}",
            disc.disc_type,
            disc.label,
            disc.tracks.len(),
            if is_tv { " (TV)" } else { "" }
        ));
        self.with_job(|job| {
            job.disc_label = disc.label.clone();
            job.disc_type = disc.disc_type;
            job.steps.set(StepId::Scan, StepStatus::Complete);
        });
        self.persist_snapshot().await;

        if is_tv {
            self.run_tv_rip(&device, &disc).await;
        } else {
            self.run_movie_rip(&device, &disc).await;
        }
    }

    async fn run_movie_rip(self: &Arc<Self>, device: &str, disc: &DiscInfo) {
        let min_secs = self.config.ripping.main_feature_min_seconds;
        let selected = self
            .with_job(|job| job.selected_tracks.clone())
            .unwrap_or_default();
        let Some(feature) = pick_movie_track(disc, &selected, min_secs) else {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::Unknown,
                format!(
                    "No main feature found: no title longer than {} minutes",
                    min_secs / 60
                ),
            ))
            .await;
            return;
        };

        self.with_job(|job| {
            job.expected_size_bytes = feature.size_bytes;
            job.steps.set(StepId::Rip, StepStatus::Active);
            let _ = job.set_status(RipStatus::Ripping);
        });
        self.persist_snapshot().await;

        let dest = self.config.paths.raw_rips.join(&disc.label);
        if let Err(e) = tokio::fs::create_dir_all(&dest).await {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::IoError,
                format!("Cannot create staging directory: {}", e),
            ))
            .await;
            return;
        }

        let engine = Arc::clone(self);
        let mut milestones = MilestoneTracker::default();
        let outcome = self
            .makemkv
            .rip_track(device, feature.index, &dest, move |pct| {
                for milestone in milestones.advance(pct) {
                    engine.activity.info(format!("Rip {}% complete", milestone));
                }
                engine.with_job(|job| {
                    job.set_progress(pct);
                    job.steps
                        .set_with_detail(StepId::Rip, StepStatus::Active, rip_progress_detail(pct));
                });
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let failure = self.classify_failure(None, &[e.to_string()]).await;
                self.finish_with_failure(failure).await;
                return;
            }
        };
        if let Some(reason) = outcome.failure_reason() {
            let mut output = outcome.error_lines.clone();
            output.push(reason);
            let failure = self.classify_failure(outcome.exit_code, &output).await;
            self.finish_with_failure(failure).await;
            return;
        }

        let output_dir = match self.resolve_output_dir(outcome.output_dir, &disc.label).await {
            Some(dir) => dir,
            None => {
                self.finish_with_failure(RipFailure::new(
                    ErrorCode::Unknown,
                    "Rip finished but its output directory could not be located",
                ))
                .await;
                return;
            }
        };
        let files = organize::mkv_files(&output_dir).await.unwrap_or_default();
        self.with_job(|job| {
            job.rip_output_dir = Some(output_dir);
            job.ripped_files = files;
            job.steps.set(StepId::Rip, StepStatus::Complete);
            job.post_processing_started = true;
            job.set_progress(100.0);
        });
        self.persist_snapshot().await;
        self.post_process().await;
    }

    async fn run_tv_rip(self: &Arc<Self>, device: &str, disc: &DiscInfo) {
        let tv_min = self.config.ripping.tv_min_episode_seconds;
        let tv_max = self.config.ripping.tv_max_episode_seconds;
        let selected = self
            .with_job(|job| job.selected_tracks.clone())
            .unwrap_or_default();
        let episodes = pick_episode_tracks(disc, &selected, tv_min, tv_max);
        if episodes.is_empty() {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::Unknown,
                "No episode tracks to rip",
            ))
            .await;
            return;
        }
        let total = episodes.len() as u32;
        let expected: u64 = episodes.iter().map(|t| t.size_bytes).sum();

        self.with_job(|job| {
            job.expected_size_bytes = expected;
            job.episodes_total = total;
            job.steps
                .set_with_detail(StepId::Rip, StepStatus::Active, format!("0/{}", total));
            let _ = job.set_status(RipStatus::Ripping);
        });
        self.persist_snapshot().await;

        let dest = self.config.paths.raw_rips.join(&disc.label);
        if let Err(e) = tokio::fs::create_dir_all(&dest).await {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::IoError,
                format!("Cannot create staging directory: {}", e),
            ))
            .await;
            return;
        }

        let mut successes: u32 = 0;
        let mut last_failed: Option<(Option<i32>, Vec<String>)> = None;
        let milestones = Arc::new(Mutex::new(MilestoneTracker::default()));
        let mut output_dir: Option<PathBuf> = None;

        for (done, track) in episodes.iter().enumerate() {
            let done = done as u32;
            self.with_job(|job| {
                job.steps.set_with_detail(
                    StepId::Rip,
                    StepStatus::Active,
                    format!("{}/{}", done + 1, total),
                );
            });

            let engine = Arc::clone(self);
            let completed = successes;
            let milestones = Arc::clone(&milestones);
            let result = self
                .makemkv
                .rip_track(device, track.index, &dest, move |pct| {
                    let overall = tv_overall_progress(completed, total, pct);
                    for milestone in milestones.lock().advance(overall) {
                        engine.activity.info(format!("Rip {}% complete", milestone));
                    }
                    engine.with_job(|job| job.set_progress(overall));
                })
                .await;

            match result {
                Ok(outcome) => {
                    if let Some(dir) = outcome.output_dir.clone()
                        && output_dir.is_none()
                    {
                        output_dir = Some(dir);
                    }
                    match outcome.failure_reason() {
                        None => {
                            successes += 1;
                            let files = organize::mkv_files(&dest).await.unwrap_or_default();
                            self.with_job(|job| {
                                job.episodes_completed = successes;
                                job.ripped_files = files;
                                job.set_progress(tv_overall_progress(successes, total, 0.0));
                            });
                        }
                        Some(reason) => {
                            warn!(track = track.index, reason = %reason, "Episode rip failed");
                            self.with_job(|job| {
                                job.episode_errors
                                    .push(format!("Track {}: {}", track.index, reason));
                            });
                            let mut output = outcome.error_lines.clone();
                            output.push(reason);
                            last_failed = Some((outcome.exit_code, output));
                        }
                    }
                }
                Err(e) => {
                    warn!(track = track.index, error = %e, "Episode rip failed to run");
                    self.with_job(|job| {
                        job.episode_errors
                            .push(format!("Track {}: {}", track.index, e));
                    });
                    last_failed = Some((None, vec![e.to_string()]));
                }
            }
            self.persist_snapshot().await;
        }

        if successes == 0 {
            let (exit_code, output) = last_failed.unwrap_or((None, Vec::new()));
            let failure = self.classify_failure(exit_code, &output).await;
            self.finish_with_failure(failure).await;
            return;
        }
        if successes < total {
            self.activity.warning(format!(
                "Ripped {}/{} episodes; the rest failed",
                successes, total
            ));
        }

        let output_dir = match self.resolve_output_dir(output_dir, &disc.label).await {
            Some(dir) => dir,
            None => {
                self.finish_with_failure(RipFailure::new(
                    ErrorCode::Unknown,
                    "Rip finished but its output directory could not be located",
                ))
                .await;
                return;
            }
        };
        self.with_job(|job| {
            job.rip_output_dir = Some(output_dir);
            job.steps.set_with_detail(
                StepId::Rip,
                StepStatus::Complete,
                format!("{}/{}", successes, total),
            );
            job.post_processing_started = true;
            job.set_progress(100.0);
        });
        self.persist_snapshot().await;
        self.post_process().await;
    }

    /// Locate the rip output: trust the directory the tool announced,
    /// otherwise search the staging area.
    async fn resolve_output_dir(
        &self,
        announced: Option<PathBuf>,
        disc_label: &str,
    ) -> Option<PathBuf> {
        if let Some(dir) = announced
            && dir.is_dir()
        {
            return Some(dir);
        }
        let window = Duration::from_secs(self.config.ripping.output_search_window_secs);
        organize::find_rip_output(&self.config.paths.raw_rips, disc_label, window).await
    }

    /// Identification and library placement, shared by the normal flow,
    /// the poll-noticed handoff, and crash recovery.
    async fn post_process(self: &Arc<Self>) {
        let snapshot = self.with_job(|job| {
            let _ = job.set_status(RipStatus::Identifying);
            job.steps.set(StepId::Identify, StepStatus::Active);
            (
                job.disc_label.clone(),
                job.disc_type,
                job.rip_output_dir.clone(),
                job.episodes_total,
                job.episodes_completed,
                job.identified_title.clone(),
                job.season,
            )
        });
        let Some((label, disc_type, output_dir, episodes_total, episodes_completed, known, season)) =
            snapshot
        else {
            return;
        };
        let Some(output_dir) = output_dir else {
            self.finish_with_failure(RipFailure::new(
                ErrorCode::Unknown,
                "Post-processing started without a rip output directory",
            ))
            .await;
            return;
        };
        self.persist_snapshot().await;

        let is_tv = episodes_total > 0;
        let size_bytes = organize::dir_size_bytes(&output_dir).await;
        let media_type = if is_tv { MediaType::Tv } else { MediaType::Movie };

        // A title confirmed by the caller at start, or recovered from a
        // snapshot, is used as-is; identification only runs when the
        // title is unknown, degrading to the label on any failure.
        let identification = match known {
            Some(title) => {
                self.activity
                    .info(format!("Using confirmed title \"{}\"", title));
                self.with_job(|job| {
                    job.steps
                        .set_with_detail(StepId::Identify, StepStatus::Complete, title.clone());
                });
                Identification {
                    title,
                    year: None,
                    media_type,
                    season,
                    episode_titles: Vec::new(),
                    runtime_minutes: None,
                    external_id: None,
                    poster_url: None,
                    confidence: 100,
                }
            }
            None => {
                let runtime = match organize::mkv_files(&output_dir).await {
                    Ok(files) => match files.first() {
                        Some(file) => crate::identify::probe_runtime_minutes(file).await,
                        None => None,
                    },
                    Err(_) => None,
                };
                let request = IdentifyRequest {
                    disc_label: label.clone(),
                    disc_type,
                    media_type,
                    runtime_minutes: runtime,
                    size_bytes,
                };
                let identification = match self.identifier.identify(&request).await {
                    Ok(identification) => identification,
                    Err(e) => {
                        warn!(error = %e, "Identification failed, using disc label");
                        Identification::fallback_from_label(&label)
                    }
                };
                self.activity.info(format!(
                    "Identified \"{}\" as \"{}\" (confidence {})",
                    label,
                    identification.display_title(),
                    identification.confidence
                ));
                self.with_job(|job| {
                    job.steps.set(StepId::Identify, StepStatus::Complete);
                });
                identification
            }
        };
        let confident =
            identification.is_confident(self.config.identification.confidence_threshold);
        let title = identification.display_title();
        let staged = organize::mkv_files(&output_dir).await.unwrap_or_default();
        self.with_job(|job| {
            job.identified_title = Some(title.clone());
            job.external_id = identification.external_id.clone();
            job.poster_url = identification.poster_url.clone();
            job.runtime_str = identification.runtime_minutes.map(|m| format!("{}m", m));
            job.size_gb = size_bytes as f64 / BYTES_PER_GB;
            if job.ripped_files.is_empty() {
                job.ripped_files = staged;
            }
            job.steps.set(StepId::Library, StepStatus::Active);
            let _ = job.set_status(RipStatus::Moving);
        });
        self.persist_snapshot().await;

        if confident {
            self.place_in_library(&output_dir, &identification, is_tv)
                .await;
        } else {
            self.place_in_review(&output_dir, &label, &identification, size_bytes)
                .await;
        }

        // Completion message
        let message = if is_tv {
            format!(
                "Ripped {}/{} episodes of {}",
                episodes_completed, episodes_total, title
            )
        } else {
            format!("Ripped {}", title)
        };
        let finished = self.with_job(|job| job.status == RipStatus::Error).unwrap_or(true);
        if !finished {
            self.finish_complete(message).await;
        }
    }

    async fn place_in_library(
        self: &Arc<Self>,
        output_dir: &std::path::Path,
        identification: &Identification,
        is_tv: bool,
    ) {
        let result = if is_tv || identification.media_type == MediaType::Tv {
            organize::organize_tv_files(
                output_dir,
                &self.config.paths.tv,
                &identification.title,
                identification.season.unwrap_or(1),
                &identification.episode_titles,
            )
            .await
        } else {
            let folder = organize::sanitize_folder_name(&identification.display_title());
            organize::move_movie_to_library(output_dir, &self.config.paths.movies, &folder).await
        };

        match result {
            Ok(target) => {
                self.with_job(|job| {
                    job.steps.set(StepId::Library, StepStatus::Complete);
                    job.steps.set(StepId::Move, StepStatus::Complete);
                    job.steps.set(StepId::ScanPlex, StepStatus::Active);
                });
                info!(target = %target.display(), "Rip placed in library");
                let delivered = self.notifier.notify_rescan().await;
                self.with_job(|job| {
                    if delivered {
                        job.steps.set(StepId::ScanPlex, StepStatus::Complete);
                    } else {
                        job.steps.set_with_detail(
                            StepId::ScanPlex,
                            StepStatus::Complete,
                            "No rescan delivered",
                        );
                    }
                });
            }
            Err(e) => {
                self.finish_with_failure(RipFailure::new(
                    ErrorCode::IoError,
                    format!("Library move failed: {}", e),
                ))
                .await;
            }
        }
    }

    async fn place_in_review(
        self: &Arc<Self>,
        output_dir: &std::path::Path,
        label: &str,
        identification: &Identification,
        size_bytes: u64,
    ) {
        let job_id = self
            .with_job(|job| job.id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let metadata = ReviewMetadata {
            disc_label: label.to_string(),
            fallback_title: identification.title.clone(),
            runtime_minutes: identification.runtime_minutes,
            size_gb: size_bytes as f64 / BYTES_PER_GB,
            files: Vec::new(),
        };
        match organize::move_to_review(
            output_dir,
            &self.config.paths.review,
            &job_id,
            label,
            metadata,
        )
        .await
        {
            Ok(target) => {
                self.activity.warning(format!(
                    "Low identification confidence; moved to review: {}",
                    target.display()
                ));
                self.with_job(|job| {
                    job.needs_review = true;
                    job.steps.set_with_detail(
                        StepId::Library,
                        StepStatus::Complete,
                        "Needs review",
                    );
                    job.steps.set(StepId::Move, StepStatus::Complete);
                    job.steps.set_with_detail(
                        StepId::ScanPlex,
                        StepStatus::Complete,
                        "Skipped (needs review)",
                    );
                });
            }
            Err(e) => {
                self.finish_with_failure(RipFailure::new(
                    ErrorCode::IoError,
                    format!("Move to review failed: {}", e),
                ))
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::notify::NoopNotifier;
    use async_trait::async_trait;
    use std::path::Path;

    struct FixedIdentifier {
        identification: Identification,
    }

    #[async_trait]
    impl Identifier for FixedIdentifier {
        async fn identify(&self, _request: &IdentifyRequest) -> Result<Identification> {
            Ok(self.identification.clone())
        }
    }

    fn test_engine(root: &Path, identification: Identification) -> Arc<RipEngine> {
        let mut config = AppConfig::default();
        config.paths.raw_rips = root.join("raw");
        config.paths.movies = root.join("movies");
        config.paths.tv = root.join("tv");
        config.paths.review = root.join("review");
        config.paths.state_dir = root.join("state");
        config.ripping.required_free_gb = 0;
        RipEngine::new(
            config,
            Arc::new(FixedIdentifier { identification }),
            Arc::new(NoopNotifier),
            Arc::new(ActivityLog::new()),
        )
    }

    fn confident_identification() -> Identification {
        Identification {
            title: "The Movie".to_string(),
            year: Some(2020),
            media_type: MediaType::Movie,
            season: None,
            episode_titles: Vec::new(),
            runtime_minutes: Some(112),
            external_id: Some("603".to_string()),
            poster_url: Some("https://images.example/603.jpg".to_string()),
            confidence: 92,
        }
    }

    fn disc_track(index: u32, duration_secs: u64) -> TrackInfo {
        TrackInfo {
            index,
            duration_secs,
            size_bytes: 0,
        }
    }

    fn vague_identification() -> Identification {
        let mut identification = confident_identification();
        identification.confidence = 40;
        identification
    }

    fn ripping_job(id: &str) -> RipJob {
        let mut job = RipJob::new("/dev/sr0");
        job.id = id.to_string();
        job.status = RipStatus::Ripping;
        job
    }

    #[test]
    fn test_tv_overall_progress() {
        assert_eq!(tv_overall_progress(0, 5, 0.0), 0.0);
        assert_eq!(tv_overall_progress(2, 5, 50.0), 50.0);
        assert_eq!(tv_overall_progress(5, 5, 0.0), 100.0);
        assert_eq!(tv_overall_progress(0, 0, 50.0), 0.0);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta_seconds(100, 50.0), Some(100));
        assert_eq!(eta_seconds(300, 75.0), Some(100));
        assert_eq!(eta_seconds(10, 0.5), None);
        assert_eq!(eta_seconds(0, 50.0), None);
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(42), "42s");
        assert_eq!(format_eta(750), "12m 30s");
        assert_eq!(format_eta(3725), "1h 02m");
    }

    #[test]
    fn test_rip_progress_detail() {
        assert_eq!(rip_progress_detail(0.0), "0%");
        assert_eq!(rip_progress_detail(42.4), "42%");
        assert_eq!(rip_progress_detail(99.6), "100%");
    }

    #[test]
    fn test_caller_tracks_override_episode_window() {
        let disc = DiscInfo {
            tracks: vec![
                disc_track(0, 5000),
                disc_track(1, 1500),
                disc_track(2, 1500),
                disc_track(3, 200),
            ],
            ..Default::default()
        };
        // An explicit selection wins, even outside the duration window
        let picked = pick_episode_tracks(&disc, &[0, 3], 1200, 3600);
        let indexes: Vec<u32> = picked.iter().map(|t| t.index).collect();
        assert_eq!(indexes, vec![0, 3]);
        // Without one, the window applies
        let picked = pick_episode_tracks(&disc, &[], 1200, 3600);
        let indexes: Vec<u32> = picked.iter().map(|t| t.index).collect();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[test]
    fn test_caller_track_overrides_main_feature() {
        let disc = DiscInfo {
            tracks: vec![disc_track(0, 6749), disc_track(1, 3000)],
            ..Default::default()
        };
        assert_eq!(pick_movie_track(&disc, &[1], 2700).map(|t| t.index), Some(1));
        assert_eq!(pick_movie_track(&disc, &[], 2700).map(|t| t.index), Some(0));
        assert!(pick_movie_track(&disc, &[9], 2700).is_none());
    }

    #[tokio::test]
    async fn test_start_rip_rejected_while_active() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        engine.state.lock().current = Some(ripping_job("busy1234"));

        let err = engine.start_rip(RipRequest::default()).unwrap_err();
        assert!(matches!(err, Error::JobActive(id) if id == "busy1234"));
    }

    #[tokio::test]
    async fn test_start_rip_allowed_after_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        let mut done = ripping_job("done1234");
        done.status = RipStatus::Complete;
        engine.state.lock().current = Some(done);

        let id = engine.start_rip(RipRequest::default()).unwrap();
        assert_eq!(id.len(), 8);
        assert_ne!(id, "done1234");
    }

    #[tokio::test]
    async fn test_start_rip_carries_caller_selection() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        let request = RipRequest {
            device: Some("/dev/sr9".to_string()),
            title: Some("Heat (1995)".to_string()),
            media_type: Some(MediaType::Tv),
            season: Some(3),
            tracks: vec![1, 3, 5],
        };
        engine.start_rip(request).unwrap();

        let job = engine.state.lock().current.clone().unwrap();
        assert_eq!(job.device, "/dev/sr9");
        assert_eq!(job.identified_title.as_deref(), Some("Heat (1995)"));
        assert_eq!(job.requested_media_type, Some(MediaType::Tv));
        assert_eq!(job.season, Some(3));
        assert_eq!(job.selected_tracks, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_cancel_clears_slot_and_records_history() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        let mut job = ripping_job("gone1234");
        job.disc_label = "THE_MOVIE".to_string();
        job.progress_pct = 42.0;
        engine.state.lock().current = Some(job);

        let id = engine.cancel().await.unwrap();
        assert_eq!(id, "gone1234");
        assert!(engine.state.lock().current.is_none());

        let recent = engine.history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "gone1234");
        assert_eq!(recent[0].status, RipStatus::Error);
    }

    #[tokio::test]
    async fn test_cancel_without_job() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        assert!(matches!(engine.cancel().await, Err(Error::NoActiveJob)));
    }

    #[tokio::test]
    async fn test_status_idle_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        assert!(engine.status().await.is_none());
    }

    #[tokio::test]
    async fn test_recover_without_snapshot_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        engine.recover().await;
        assert!(engine.state.lock().current.is_none());
    }

    #[tokio::test]
    async fn test_recover_discards_incomplete_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());
        let mut job = ripping_job("stale123");
        job.expected_size_bytes = 1_000_000;
        job.rip_output_dir = Some(tmp.path().join("raw/NOPE"));
        engine
            .snapshots
            .save(&JobSnapshot::from_job(&job))
            .await
            .unwrap();

        engine.recover().await;
        assert!(engine.state.lock().current.is_none());
        assert!(engine.snapshots.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_resumes_post_processing_to_library() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());

        let output = tmp.path().join("raw/THE_MOVIE");
        tokio::fs::create_dir_all(&output).await.unwrap();
        tokio::fs::write(output.join("title_t00.mkv"), vec![0u8; 1000])
            .await
            .unwrap();

        let mut job = ripping_job("resume12");
        job.disc_label = "THE_MOVIE".to_string();
        job.expected_size_bytes = 1000;
        job.rip_output_dir = Some(output.clone());
        engine
            .snapshots
            .save(&JobSnapshot::from_job(&job))
            .await
            .unwrap();

        engine.recover().await;

        // Post-processing runs in the background; wait for the terminal state
        for _ in 0..100 {
            let done = engine
                .with_job(|job| job.status.is_terminal())
                .unwrap_or(false);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let job = engine.state.lock().current.clone().unwrap();
        assert_eq!(job.status, RipStatus::Complete);
        assert!(!job.needs_review);
        let target = tmp.path().join("movies/The Movie (2020)/The Movie (2020).mkv");
        assert!(target.is_file());
        assert!(engine.snapshots.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_low_confidence_routes_to_review() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), vague_identification());

        let output = tmp.path().join("raw/MYSTERY");
        tokio::fs::create_dir_all(&output).await.unwrap();
        tokio::fs::write(output.join("title_t00.mkv"), vec![0u8; 1000])
            .await
            .unwrap();

        let mut job = ripping_job("review12");
        job.disc_label = "MYSTERY".to_string();
        job.rip_output_dir = Some(output.clone());
        job.post_processing_started = true;
        engine.state.lock().current = Some(job);

        engine.post_process().await;

        let job = engine.state.lock().current.clone().unwrap();
        assert_eq!(job.status, RipStatus::Complete);
        assert!(job.needs_review);
        assert_eq!(
            job.steps.get(StepId::ScanPlex).detail.as_deref(),
            Some("Skipped (needs review)")
        );
        let review_dir = tmp.path().join("review/review12_MYSTERY");
        assert!(review_dir.join("title_t00.mkv").is_file());
        assert!(review_dir.join("review_metadata.json").is_file());
    }

    #[tokio::test]
    async fn test_known_title_skips_identification() {
        let tmp = tempfile::tempdir().unwrap();
        // The identifier would answer "The Movie (2020)"; it must not be asked.
        let engine = test_engine(tmp.path(), confident_identification());

        let output = tmp.path().join("raw/KNOWN");
        tokio::fs::create_dir_all(&output).await.unwrap();
        tokio::fs::write(output.join("title_t00.mkv"), vec![0u8; 1000])
            .await
            .unwrap();

        let mut job = ripping_job("known123");
        job.disc_label = "KNOWN".to_string();
        job.identified_title = Some("Known Title (1999)".to_string());
        job.rip_output_dir = Some(output);
        job.post_processing_started = true;
        engine.state.lock().current = Some(job);

        engine.post_process().await;

        let job = engine.state.lock().current.clone().unwrap();
        assert_eq!(job.status, RipStatus::Complete);
        assert_eq!(job.identified_title.as_deref(), Some("Known Title (1999)"));
        assert_eq!(
            job.steps.get(StepId::Identify).detail.as_deref(),
            Some("Known Title (1999)")
        );
        assert!(!job.needs_review);
        let target = tmp
            .path()
            .join("movies/Known Title (1999)/Known Title (1999).mkv");
        assert!(target.is_file());
    }

    #[tokio::test]
    async fn test_post_processing_records_enrichment() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path(), confident_identification());

        let output = tmp.path().join("raw/THE_MOVIE");
        tokio::fs::create_dir_all(&output).await.unwrap();
        tokio::fs::write(output.join("title_t00.mkv"), vec![0u8; 2048])
            .await
            .unwrap();

        let mut job = ripping_job("enrich12");
        job.disc_label = "THE_MOVIE".to_string();
        job.rip_output_dir = Some(output);
        job.post_processing_started = true;
        engine.state.lock().current = Some(job);

        engine.post_process().await;

        let job = engine.state.lock().current.clone().unwrap();
        assert_eq!(job.status, RipStatus::Complete);
        assert_eq!(job.external_id.as_deref(), Some("603"));
        assert_eq!(
            job.poster_url.as_deref(),
            Some("https://images.example/603.jpg")
        );
        assert_eq!(job.runtime_str.as_deref(), Some("112m"));
        assert!(job.size_gb > 0.0);
        assert_eq!(job.ripped_files.len(), 1);

        let recent = engine.history.recent(1).await.unwrap();
        assert_eq!(recent[0].external_id.as_deref(), Some("603"));
        assert_eq!(recent[0].runtime_str.as_deref(), Some("112m"));
        assert!(recent[0].size_gb > 0.0);
    }

    #[tokio::test]
    async fn test_tv_post_processing_organizes_episodes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut identification = confident_identification();
        identification.title = "Some Show".to_string();
        identification.year = None;
        identification.media_type = MediaType::Tv;
        identification.season = Some(2);
        identification.episode_titles = vec!["One".to_string(), "Two".to_string()];
        let engine = test_engine(tmp.path(), identification);

        let output = tmp.path().join("raw/SHOW_S2");
        tokio::fs::create_dir_all(&output).await.unwrap();
        tokio::fs::write(output.join("t00.mkv"), vec![0u8; 100])
            .await
            .unwrap();
        tokio::fs::write(output.join("t01.mkv"), vec![0u8; 100])
            .await
            .unwrap();

        let mut job = ripping_job("tvjob123");
        job.disc_label = "SHOW_S2".to_string();
        job.rip_output_dir = Some(output);
        job.episodes_total = 2;
        job.episodes_completed = 2;
        job.post_processing_started = true;
        engine.state.lock().current = Some(job);

        engine.post_process().await;

        let job = engine.state.lock().current.clone().unwrap();
        assert_eq!(job.status, RipStatus::Complete);
        assert_eq!(
            job.message.as_deref(),
            Some("Ripped 2/2 episodes of Some Show")
        );
        let season_dir = tmp.path().join("tv/Some Show/Season 02");
        assert!(season_dir.join("Some Show - S02E01 - One.mkv").is_file());
        assert!(season_dir.join("Some Show - S02E02 - Two.mkv").is_file());
    }

    #[tokio::test]
    async fn test_partial_tv_rip_still_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut identification = confident_identification();
        identification.title = "Some Show".to_string();
        identification.year = None;
        identification.media_type = MediaType::Tv;
        identification.season = Some(1);
        let engine = test_engine(tmp.path(), identification);

        let output = tmp.path().join("raw/SHOW_S1");
        tokio::fs::create_dir_all(&output).await.unwrap();
        for name in ["t00.mkv", "t02.mkv", "t04.mkv"] {
            tokio::fs::write(output.join(name), vec![0u8; 100])
                .await
                .unwrap();
        }

        let mut job = ripping_job("tvpart12");
        job.disc_label = "SHOW_S1".to_string();
        job.rip_output_dir = Some(output);
        job.episodes_total = 5;
        job.episodes_completed = 3;
        job.episode_errors = vec![
            "Track 1: disc read error (bad sector)".to_string(),
            "Track 3: disc read error (bad sector)".to_string(),
        ];
        job.post_processing_started = true;
        engine.state.lock().current = Some(job);

        engine.post_process().await;

        let job = engine.state.lock().current.clone().unwrap();
        assert_eq!(job.status, RipStatus::Complete);
        assert_eq!(
            job.message.as_deref(),
            Some("Ripped 3/5 episodes of Some Show")
        );
        assert_eq!(job.episode_errors.len(), 2);
        assert_eq!(job.ripped_files.len(), 3);
    }
}
