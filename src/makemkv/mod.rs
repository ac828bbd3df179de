//! makemkvcon adapter.
//!
//! Wraps the external `makemkvcon` binary in robot mode: disc scanning,
//! track ripping with streamed progress, and process control (finding and
//! killing a live rip, ejecting the disc).

pub mod parser;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sysinfo::System;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
pub use parser::{DiscInfo, DiscType, TrackInfo};

/// Process name of the external ripper, used for liveness checks and kills.
pub const MAKEMKV_PROCESS_NAME: &str = "makemkvcon";

/// Map a device node to makemkvcon's `disc:N` source argument.
///
/// `/dev/sr0` maps to `disc:0`, `/dev/sr1` to `disc:1`, and so on.
/// Anything unrecognized falls back to `disc:0`.
pub fn device_to_disc_arg(device: &str) -> String {
    let index = device
        .rsplit("/sr")
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    format!("disc:{}", index)
}

/// Human-readable meaning of a makemkvcon exit code.
pub fn exit_code_message(code: i32) -> String {
    match code {
        1 => "general error".to_string(),
        2 => "invalid argument".to_string(),
        12 => "disc read error (bad sector)".to_string(),
        13 => "drive hardware error".to_string(),
        15 => "copy protection error".to_string(),
        n => format!("exit code {}", n),
    }
}

/// Result of a single track rip attempt.
#[derive(Debug, Clone, Default)]
pub struct RipOutcome {
    /// Process exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Number of PRGV progress lines seen.
    pub progress_lines: u64,
    /// Output directory announced by makemkvcon, if any.
    pub output_dir: Option<PathBuf>,
    /// Message texts that looked like errors.
    pub error_lines: Vec<String>,
}

impl RipOutcome {
    /// Why this rip failed, or `None` if it succeeded.
    ///
    /// A clean exit that never reported progress is still a failure: the
    /// tool exits 0 on some unreadable discs without writing anything.
    pub fn failure_reason(&self) -> Option<String> {
        match self.exit_code {
            Some(0) => {
                if self.progress_lines == 0 {
                    Some("makemkvcon exited cleanly without reporting any progress".to_string())
                } else {
                    None
                }
            }
            Some(code) => Some(exit_code_message(code)),
            None => Some("makemkvcon terminated by signal".to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_reason().is_none()
    }
}

/// A live makemkvcon process found on the system.
#[derive(Debug, Clone)]
pub struct LiveRip {
    pub pid: u32,
    /// Output directory taken from the last command-line argument.
    pub output_dir: Option<PathBuf>,
}

/// Adapter around the makemkvcon binary.
#[derive(Debug, Clone)]
pub struct MakeMkv {
    binary: String,
    /// Minimum title length passed to the scanner, in seconds.
    min_title_secs: u64,
}

impl MakeMkv {
    pub fn new(binary: impl Into<String>, min_title_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            min_title_secs,
        }
    }

    /// Whether a disc appears to be present: the device node exists.
    pub fn disc_present(&self, device: &str) -> bool {
        Path::new(device).exists()
    }

    /// Scan the disc and return its label, type, and track list.
    pub async fn get_disc_info(&self, device: &str) -> Result<DiscInfo> {
        let disc_arg = device_to_disc_arg(device);
        let minlength = format!("--minlength={}", self.min_title_secs);
        debug!(device = %device, source = %disc_arg, "Scanning disc");

        let mut child = Command::new(&self.binary)
            .args(["-r", "--cache=1", "info", &disc_arg, &minlength])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::other("Failed to capture makemkvcon stdout"))?;

        let mut builder = parser::DiscInfoBuilder::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            builder.feed(&line);
        }

        let status = child.wait().await?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(Error::disc(format!(
                "Disc scan failed: {}",
                exit_code_message(code)
            )));
        }

        let info = builder.finish();
        info!(
            label = %info.label,
            disc_type = %info.disc_type,
            tracks = info.tracks.len(),
            "Disc scan complete"
        );
        Ok(info)
    }

    /// Rip a single track into `dest`, streaming progress to `on_progress`.
    ///
    /// Returns `Ok` with an outcome even when makemkvcon reports failure;
    /// `Err` only covers spawn/IO problems. Inspect
    /// [`RipOutcome::failure_reason`] for the result.
    pub async fn rip_track<F>(
        &self,
        device: &str,
        track: u32,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<RipOutcome>
    where
        F: FnMut(f64) + Send,
    {
        let disc_arg = device_to_disc_arg(device);
        let track_arg = track.to_string();
        let dest_arg = dest.to_string_lossy().to_string();
        info!(device = %device, track, dest = %dest_arg, "Starting track rip");

        let mut child = Command::new(&self.binary)
            .args([
                "-r",
                "--progress=-stdout",
                "mkv",
                &disc_arg,
                &track_arg,
                &dest_arg,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::other("Failed to capture makemkvcon stdout"))?;

        let mut outcome = RipOutcome::default();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(pct) = parser::parse_prgv_percent(&line) {
                outcome.progress_lines += 1;
                on_progress(pct);
            } else if let Some(msg) = parser::parse_msg(&line) {
                if outcome.output_dir.is_none()
                    && let Some(dir) = parser::extract_saving_dir(&msg.text)
                {
                    debug!(dir = %dir.display(), "makemkvcon output directory");
                    outcome.output_dir = Some(dir);
                }
                if parser::is_error_text(&msg.text) {
                    outcome.error_lines.push(msg.text);
                }
            }
        }

        let status = child.wait().await?;
        outcome.exit_code = status.code();
        if let Some(reason) = outcome.failure_reason() {
            warn!(track, reason = %reason, "Track rip failed");
        } else {
            info!(track, "Track rip complete");
        }
        Ok(outcome)
    }

    /// Find a live makemkvcon process, if one is running.
    pub fn find_live_process(&self) -> Option<LiveRip> {
        let system = System::new_all();
        let process = system
            .processes_by_name(OsStr::new(MAKEMKV_PROCESS_NAME))
            .next()?;
        let output_dir = process
            .cmd()
            .last()
            .map(|arg| PathBuf::from(arg.to_string_lossy().to_string()))
            .filter(|p| p.is_absolute());
        Some(LiveRip {
            pid: process.pid().as_u32(),
            output_dir,
        })
    }

    /// Kill any live makemkvcon processes. Returns the number killed.
    pub fn kill_live_processes(&self) -> usize {
        let system = System::new_all();
        let mut killed = 0;
        for process in system.processes_by_name(OsStr::new(MAKEMKV_PROCESS_NAME)) {
            if process.kill() {
                info!(pid = process.pid().as_u32(), "Killed makemkvcon process");
                killed += 1;
            }
        }
        killed
    }

    /// Eject the disc, best effort.
    pub async fn eject(&self, device: &str) {
        match Command::new("eject").arg(device).status().await {
            Ok(status) if status.success() => info!(device = %device, "Disc ejected"),
            Ok(status) => warn!(device = %device, code = ?status.code(), "eject failed"),
            Err(e) => warn!(device = %device, error = %e, "Failed to run eject"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_to_disc_arg() {
        assert_eq!(device_to_disc_arg("/dev/sr0"), "disc:0");
        assert_eq!(device_to_disc_arg("/dev/sr1"), "disc:1");
        assert_eq!(device_to_disc_arg("/dev/sr12"), "disc:12");
        assert_eq!(device_to_disc_arg("/dev/cdrom"), "disc:0");
    }

    #[test]
    fn test_exit_code_messages() {
        assert_eq!(exit_code_message(12), "disc read error (bad sector)");
        assert_eq!(exit_code_message(15), "copy protection error");
        assert_eq!(exit_code_message(47), "exit code 47");
    }

    #[test]
    fn test_silent_failure() {
        let outcome = RipOutcome {
            exit_code: Some(0),
            progress_lines: 0,
            ..Default::default()
        };
        assert!(!outcome.is_success());
        assert!(
            outcome
                .failure_reason()
                .is_some_and(|r| r.contains("without reporting any progress"))
        );
    }

    #[test]
    fn test_clean_exit_with_progress_is_success() {
        let outcome = RipOutcome {
            exit_code: Some(0),
            progress_lines: 512,
            ..Default::default()
        };
        assert!(outcome.is_success());
    }

    #[test]
    fn test_nonzero_exit_maps_through_table() {
        let outcome = RipOutcome {
            exit_code: Some(13),
            progress_lines: 100,
            ..Default::default()
        };
        assert_eq!(
            outcome.failure_reason().as_deref(),
            Some("drive hardware error")
        );
    }
}
