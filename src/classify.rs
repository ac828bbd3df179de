//! Rip failure classification.
//!
//! Turns a failed rip (exit code, captured tool output, system state) into
//! a stable numeric error code with a category, a recoverable flag, and a
//! user-facing suggestion. Checks run in priority order: disc presence,
//! disk space, tool output patterns, kernel log patterns, then the exit
//! code map.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;
use sysinfo::Disks;
use tokio::process::Command;
use tracing::{debug, warn};

/// How long to wait for the kernel log probe before giving up.
const DMESG_TIMEOUT: Duration = Duration::from_secs(2);

/// How many trailing kernel log lines to inspect.
const DMESG_TAIL_LINES: usize = 50;

/// Broad failure category, derived from the numeric code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ErrorCategory {
    Disc,
    Protection,
    Drive,
    Io,
    Space,
    Process,
    Network,
    Unknown,
}

/// Stable numeric failure codes.
///
/// The hundreds digit encodes the category: 1xx disc, 2xx protection,
/// 3xx drive, 4xx io, 5xx space, 6xx process, 7xx network, 999 unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ErrorCode {
    NoDisc = 101,
    DiscRead = 102,
    BadSector = 103,
    DirtyDisc = 104,
    AacsFailure = 201,
    CssFailure = 202,
    FakePlaylists = 203,
    BdPlus = 204,
    HashCheckFailed = 205,
    DriveHardware = 301,
    DriveNotFound = 302,
    DriveBusy = 303,
    DiscEjected = 304,
    IoError = 401,
    DiskFull = 501,
    ToolCrash = 601,
    ToolKilled = 602,
    Timeout = 603,
    Unknown = 999,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, String> {
        use ErrorCode::*;
        let code = match value {
            101 => NoDisc,
            102 => DiscRead,
            103 => BadSector,
            104 => DirtyDisc,
            201 => AacsFailure,
            202 => CssFailure,
            203 => FakePlaylists,
            204 => BdPlus,
            205 => HashCheckFailed,
            301 => DriveHardware,
            302 => DriveNotFound,
            303 => DriveBusy,
            304 => DiscEjected,
            401 => IoError,
            501 => DiskFull,
            601 => ToolCrash,
            602 => ToolKilled,
            603 => Timeout,
            999 => Unknown,
            other => return Err(format!("unknown error code {}", other)),
        };
        Ok(code)
    }
}

impl ErrorCode {
    /// Category from the hundreds digit of the numeric code.
    pub fn category(self) -> ErrorCategory {
        match (self as u16) / 100 {
            1 => ErrorCategory::Disc,
            2 => ErrorCategory::Protection,
            3 => ErrorCategory::Drive,
            4 => ErrorCategory::Io,
            5 => ErrorCategory::Space,
            6 => ErrorCategory::Process,
            7 => ErrorCategory::Network,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether retrying without intervention has a realistic chance.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorCode::NoDisc
                | ErrorCode::DirtyDisc
                | ErrorCode::DriveBusy
                | ErrorCode::DiscEjected
                | ErrorCode::Timeout
        )
    }

    /// User-facing suggestion for this failure, if one exists.
    pub fn suggestion(self) -> Option<&'static str> {
        use ErrorCode::*;
        match self {
            NoDisc => Some("Insert a disc and try again"),
            DiscRead | BadSector => Some("The disc may be damaged; clean it and retry"),
            DirtyDisc => Some("Clean the disc and retry"),
            AacsFailure | CssFailure | BdPlus => {
                Some("Update MakeMKV to the latest version and check its registration key")
            }
            FakePlaylists => Some("Select the correct title manually in MakeMKV"),
            HashCheckFailed => Some("Clean the disc; the drive read inconsistent data"),
            DriveHardware | DriveNotFound => Some("Check the optical drive and its cabling"),
            DriveBusy => Some("Wait for the drive to settle and retry"),
            DiscEjected => Some("Re-insert the disc and start the rip again"),
            IoError => Some("Check the drive connection and system logs"),
            DiskFull => Some("Free up disk space on the output drive"),
            Timeout => Some("Retry the rip"),
            ToolCrash | ToolKilled | Unknown => None,
        }
    }
}

/// A classified rip failure, attached to the job and returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RipFailure {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl RipFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            message: message.into(),
            recoverable: code.is_recoverable(),
            suggestion: code.suggestion().map(str::to_string),
        }
    }

    /// Render as `[CATEGORY] message - suggestion`.
    pub fn format_message(&self) -> String {
        match &self.suggestion {
            Some(s) => format!("[{}] {} - {}", self.category, self.message, s),
            None => format!("[{}] {}", self.category, self.message),
        }
    }
}

fn stdout_patterns() -> &'static [(Regex, ErrorCode)] {
    static PATTERNS: OnceLock<Vec<(Regex, ErrorCode)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)aacs", ErrorCode::AacsFailure),
            (r"(?i)css.{0,24}(key|error|fail)", ErrorCode::CssFailure),
            (r"(?i)fake playlist", ErrorCode::FakePlaylists),
            (r"(?i)bd\+", ErrorCode::BdPlus),
            (r"(?i)hash check failed", ErrorCode::HashCheckFailed),
            (r"(?i)scsi error", ErrorCode::DiscRead),
            (r"(?i)no medium", ErrorCode::NoDisc),
            (r"(?i)(device|drive|resource).{0,24}busy", ErrorCode::DriveBusy),
            (r"(?i)no space left", ErrorCode::DiskFull),
            (r"(?i)i/o error", ErrorCode::IoError),
            (r"(?i)time.?out", ErrorCode::Timeout),
        ]
        .into_iter()
        .map(|(pattern, code)| {
            let regex = Regex::new(pattern).unwrap_or_else(|e| {
                panic!("invalid builtin pattern {:?}: {}", pattern, e);
            });
            (regex, code)
        })
        .collect()
    })
}

fn kernel_patterns() -> &'static [(Regex, ErrorCode)] {
    static PATTERNS: OnceLock<Vec<(Regex, ErrorCode)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"ILLEGAL REQUEST", ErrorCode::DiscRead),
            (r"Medium Error", ErrorCode::DiscRead),
            (r"Medium not present", ErrorCode::NoDisc),
            (r"Unit Attention", ErrorCode::DiscEjected),
            (r"Remote I/O", ErrorCode::IoError),
            (r"sr\d+.*I/O error|I/O error.*sr\d+", ErrorCode::IoError),
        ]
        .into_iter()
        .map(|(pattern, code)| {
            let regex = Regex::new(pattern).unwrap_or_else(|e| {
                panic!("invalid builtin pattern {:?}: {}", pattern, e);
            });
            (regex, code)
        })
        .collect()
    })
}

/// Match captured tool output against the known failure patterns.
pub fn classify_stdout(output: &str) -> Option<ErrorCode> {
    stdout_patterns()
        .iter()
        .find(|(regex, _)| regex.is_match(output))
        .map(|(_, code)| *code)
}

/// Match kernel log lines against the known failure patterns.
pub fn classify_kernel_log(log: &str) -> Option<ErrorCode> {
    kernel_patterns()
        .iter()
        .find(|(regex, _)| regex.is_match(log))
        .map(|(_, code)| *code)
}

/// Map a makemkvcon exit code to a failure code.
pub fn classify_exit_code(code: i32) -> ErrorCode {
    match code {
        12 => ErrorCode::BadSector,
        13 => ErrorCode::DriveHardware,
        15 => ErrorCode::AacsFailure,
        -9 | -15 => ErrorCode::ToolKilled,
        _ => ErrorCode::Unknown,
    }
}

/// Available bytes on the filesystem containing `path`, by longest
/// mount-point match.
pub fn available_space_for(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let path_str = path.to_string_lossy();
    let mut best: Option<(u64, usize)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point().to_string_lossy();
        if path_str.starts_with(mount.as_ref()) {
            let len = mount.len();
            if best.is_none_or(|(_, best_len)| len > best_len) {
                best = Some((disk.available_space(), len));
            }
        }
    }
    best.map(|(avail, _)| avail)
}

/// Grab the tail of the kernel log, best effort.
async fn read_kernel_log_tail() -> Option<String> {
    let output = tokio::time::timeout(
        DMESG_TIMEOUT,
        Command::new("dmesg")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(DMESG_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

/// Classify a failed rip.
///
/// Checks run in priority order; the first conclusive signal wins:
/// 1. the device node is gone (disc ejected mid-rip)
/// 2. the output filesystem is out of space
/// 3. tool output matches a known failure pattern
/// 4. the kernel log tail matches a known failure pattern
/// 5. the exit code map
pub async fn classify(
    exit_code: Option<i32>,
    tool_output: &[String],
    device: &str,
    output_root: &Path,
    required_free_bytes: u64,
) -> RipFailure {
    if !Path::new(device).exists() {
        return RipFailure::new(
            ErrorCode::DiscEjected,
            format!("Device {} not found; the disc may have been ejected", device),
        );
    }

    if required_free_bytes > 0 {
        match available_space_for(output_root) {
            Some(available) if available < required_free_bytes => {
                return RipFailure::new(
                    ErrorCode::DiskFull,
                    format!(
                        "Only {:.1} GB free on {}, {:.1} GB required",
                        available as f64 / 1e9,
                        output_root.display(),
                        required_free_bytes as f64 / 1e9
                    ),
                );
            }
            Some(_) => {}
            None => debug!(path = %output_root.display(), "Could not determine free space"),
        }
    }

    let joined = tool_output.join("\n");
    if !joined.is_empty()
        && let Some(code) = classify_stdout(&joined)
    {
        let first = tool_output.first().cloned().unwrap_or_default();
        return RipFailure::new(code, first);
    }

    if let Some(log) = read_kernel_log_tail()
        .await
        .filter(|log| !log.is_empty())
        && let Some(code) = classify_kernel_log(&log)
    {
        return RipFailure::new(code, "Kernel reported an optical drive error");
    }

    match exit_code {
        Some(0) => RipFailure::new(
            ErrorCode::Unknown,
            "makemkvcon exited cleanly without producing output",
        ),
        Some(code) => {
            let mapped = classify_exit_code(code);
            if mapped == ErrorCode::Unknown {
                warn!(code, "Unrecognized makemkvcon exit code");
            }
            RipFailure::new(
                mapped,
                format!("makemkvcon failed: {}", crate::makemkv::exit_code_message(code)),
            )
        }
        None => RipFailure::new(ErrorCode::ToolKilled, "makemkvcon terminated by signal"),
    }
}
