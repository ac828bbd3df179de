//! Robot-mode output parsing for makemkvcon.
//!
//! makemkvcon with `--robot` emits machine-readable lines:
//! - `PRGV:current,total,max` - progress values
//! - `MSG:code,flags,count,"text",...` - log messages
//! - `CINFO:id,code,"value"` - disc attributes
//! - `TINFO:track,id,code,"value"` - per-track attributes
//!
//! Everything here is pure line parsing and track selection; process
//! handling lives in the adapter.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Disc attribute id for the volume label.
const CINFO_LABEL: u32 = 2;
/// Disc attribute id for the type string ("Blu-ray disc", "DVD disc").
const CINFO_TYPE: u32 = 1;
/// Track attribute id for the duration ("H:MM:SS" or "MM:SS").
const TINFO_DURATION: u32 = 9;
/// Track attribute id for the size in bytes.
const TINFO_SIZE: u32 = 11;

/// Label used when the disc reports no volume name.
pub const UNKNOWN_DISC_LABEL: &str = "UNKNOWN_DISC";

/// Kind of optical disc in the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiscType {
    Bluray,
    Dvd,
    #[default]
    Unknown,
}

impl DiscType {
    fn from_type_string(s: &str) -> Self {
        if s.contains("Blu-ray") {
            DiscType::Bluray
        } else if s.contains("DVD") {
            DiscType::Dvd
        } else {
            DiscType::Unknown
        }
    }
}

/// A single title on the disc.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Track index as reported by makemkvcon.
    pub index: u32,
    /// Duration in seconds.
    pub duration_secs: u64,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// Parsed disc information from an `info` scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscInfo {
    pub label: String,
    pub disc_type: DiscType,
    pub tracks: Vec<TrackInfo>,
}

impl DiscInfo {
    /// Total size of all tracks in bytes.
    pub fn total_size_bytes(&self) -> u64 {
        self.tracks.iter().map(|t| t.size_bytes).sum()
    }

    /// The main feature: the longest track strictly over `min_secs`.
    ///
    /// Duration ties go to the lowest track index; multi-angle discs
    /// expose one title per angle and the first angle is the real one.
    pub fn main_feature(&self, min_secs: u64) -> Option<&TrackInfo> {
        self.tracks
            .iter()
            .filter(|t| t.duration_secs > min_secs)
            .min_by_key(|t| (std::cmp::Reverse(t.duration_secs), t.index))
    }

    /// Tracks whose duration falls within `[min_secs, max_secs]` inclusive.
    pub fn episode_tracks(&self, min_secs: u64, max_secs: u64) -> Vec<&TrackInfo> {
        self.tracks
            .iter()
            .filter(|t| t.duration_secs >= min_secs && t.duration_secs <= max_secs)
            .collect()
    }

    /// A disc is treated as a TV disc when at least two tracks look like
    /// episodes.
    pub fn is_tv_disc(&self, min_secs: u64, max_secs: u64) -> bool {
        self.episode_tracks(min_secs, max_secs).len() >= 2
    }
}

/// Incremental builder fed one robot-mode line at a time during a scan.
#[derive(Debug, Default)]
pub struct DiscInfoBuilder {
    label: Option<String>,
    disc_type: DiscType,
    tracks: Vec<TrackInfo>,
}

impl DiscInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one output line, updating the in-progress disc info.
    pub fn feed(&mut self, line: &str) {
        if let Some((id, value)) = parse_cinfo(line) {
            match id {
                CINFO_LABEL if !value.is_empty() => self.label = Some(value),
                CINFO_TYPE => self.disc_type = DiscType::from_type_string(&value),
                _ => {}
            }
        } else if let Some((track, id, value)) = parse_tinfo(line) {
            match id {
                TINFO_DURATION => {
                    if let Some(secs) = parse_duration_secs(&value) {
                        self.track_mut(track).duration_secs = secs;
                    }
                }
                TINFO_SIZE => {
                    if let Ok(bytes) = value.parse::<u64>() {
                        self.track_mut(track).size_bytes = bytes;
                    }
                }
                _ => {}
            }
        }
    }

    pub fn finish(self) -> DiscInfo {
        DiscInfo {
            label: self.label.unwrap_or_else(|| UNKNOWN_DISC_LABEL.to_string()),
            disc_type: self.disc_type,
            tracks: self.tracks,
        }
    }

    fn track_mut(&mut self, index: u32) -> &mut TrackInfo {
        if let Some(pos) = self.tracks.iter().position(|t| t.index == index) {
            &mut self.tracks[pos]
        } else {
            self.tracks.push(TrackInfo {
                index,
                ..Default::default()
            });
            let last = self.tracks.len() - 1;
            &mut self.tracks[last]
        }
    }
}

/// Parse a `PRGV:current,total,max` line into a percentage.
///
/// Returns `None` for non-PRGV lines or a zero max.
pub fn parse_prgv_percent(line: &str) -> Option<f64> {
    let rest = line.strip_prefix("PRGV:")?;
    let mut fields = rest.split(',');
    let current: f64 = fields.next()?.trim().parse().ok()?;
    let _total: f64 = fields.next()?.trim().parse().ok()?;
    let max: f64 = fields.next()?.trim().parse().ok()?;
    if max > 0.0 {
        Some((current / max * 100.0).clamp(0.0, 100.0))
    } else {
        None
    }
}

/// A parsed `MSG:` line: numeric code plus the human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgLine {
    pub code: i32,
    pub text: String,
}

/// Parse a `MSG:code,flags,count,"text",...` line.
pub fn parse_msg(line: &str) -> Option<MsgLine> {
    let rest = line.strip_prefix("MSG:")?;
    let code: i32 = rest.split(',').next()?.trim().parse().ok()?;
    let text = first_quoted_field(rest)?;
    Some(MsgLine { code, text })
}

/// Parse a `CINFO:id,code,"value"` line.
pub fn parse_cinfo(line: &str) -> Option<(u32, String)> {
    let rest = line.strip_prefix("CINFO:")?;
    let id: u32 = rest.split(',').next()?.trim().parse().ok()?;
    let value = first_quoted_field(rest).unwrap_or_default();
    Some((id, value))
}

/// Parse a `TINFO:track,id,code,"value"` line.
pub fn parse_tinfo(line: &str) -> Option<(u32, u32, String)> {
    let rest = line.strip_prefix("TINFO:")?;
    let mut fields = rest.split(',');
    let track: u32 = fields.next()?.trim().parse().ok()?;
    let id: u32 = fields.next()?.trim().parse().ok()?;
    let value = first_quoted_field(rest).unwrap_or_default();
    Some((track, id, value))
}

/// Parse a duration string in `H:MM:SS` or `MM:SS` form into seconds.
pub fn parse_duration_secs(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let nums: Vec<u64> = parts
        .iter()
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match nums.as_slice() {
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        [m, s] => Some(m * 60 + s),
        _ => None,
    }
}

/// Extract the output directory from a "saving ... directory file://..."
/// message emitted at the start of a rip.
pub fn extract_saving_dir(text: &str) -> Option<PathBuf> {
    let lower = text.to_lowercase();
    if !lower.contains("saving") || !lower.contains("directory") {
        return None;
    }
    let pos = lower.find("file://")?;
    let path = text[pos + "file://".len()..]
        .split_whitespace()
        .next()?
        .trim_end_matches(|c| c == '"' || c == '\'' || c == '.');
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Whether a message line looks like an error worth keeping for diagnosis.
pub fn is_error_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("error") || lower.contains("fail")
}

/// Extract the content of the first double-quoted field, handling
/// backslash-escaped quotes.
fn first_quoted_field(s: &str) -> Option<String> {
    let start = s.find('"')?;
    let mut out = String::new();
    let mut escaped = false;
    for c in s[start + 1..].chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some(out);
        } else {
            out.push(c);
        }
    }
    None
}
