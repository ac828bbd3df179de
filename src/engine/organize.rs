//! File organization: library moves, TV episode naming, review holding.
//!
//! Everything here works on directories of `.mkv` files produced by a
//! finished rip. Moves prefer `rename` and fall back to copy-and-delete
//! when the source and destination sit on different filesystems.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Clean a title into a filesystem-safe folder name.
///
/// Colons become " -" (Plex convention), outright illegal characters are
/// stripped, and whitespace runs collapse.
pub fn sanitize_folder_name(name: &str) -> String {
    let replaced = name.replace(':', " -");
    let stripped: String = replaced
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '|' | '?' | '*' | '/' | '\\'))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// All `.mkv` files directly inside `dir`, sorted by file name.
pub async fn mkv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mkv"))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Total size of all regular files directly inside `dir`, in bytes.
/// Returns 0 when the directory is missing.
pub async fn dir_size_bytes(dir: &Path) -> u64 {
    let mut total = 0;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await
            && meta.is_file()
        {
            total += meta.len();
        }
    }
    total
}

/// Move a file, falling back to copy-and-delete across filesystems.
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dst).await?;
    tokio::fs::remove_file(src).await?;
    Ok(())
}

/// Remove a directory once its rip files have been moved out. Leftover
/// clutter (logs, partial files) goes with it.
async fn remove_emptied_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "Could not remove emptied rip directory");
    }
}

/// Move a finished movie rip into the library.
///
/// Three cases relative to the movies root:
/// 1. the rip already sits in the target folder: rename files in place
/// 2. the rip sits elsewhere under the root: move files, drop the old dir
/// 3. the rip sits outside the root entirely: same as 2
///
/// Files become `{folder}.mkv`, or `{folder} - Part N.mkv` when the rip
/// produced several.
pub async fn move_movie_to_library(
    output_dir: &Path,
    movies_root: &Path,
    folder_name: &str,
) -> Result<PathBuf> {
    let target = movies_root.join(folder_name);
    let files = mkv_files(output_dir).await?;
    if files.is_empty() {
        return Err(Error::rip(format!(
            "No mkv files found in {}",
            output_dir.display()
        )));
    }

    let in_place = output_dir == target;
    if !in_place {
        tokio::fs::create_dir_all(&target).await?;
    }

    let multiple = files.len() > 1;
    for (index, file) in files.iter().enumerate() {
        let new_name = if multiple {
            format!("{} - Part {}.mkv", folder_name, index + 1)
        } else {
            format!("{}.mkv", folder_name)
        };
        let dest = target.join(&new_name);
        debug!(from = %file.display(), to = %dest.display(), "Placing movie file");
        move_file(file, &dest).await?;
    }

    if !in_place {
        remove_emptied_dir(output_dir).await;
    }
    info!(target = %target.display(), files = files.len(), "Movie moved to library");
    Ok(target)
}

/// Organize ripped TV episodes into `{tv}/{Series}/Season NN/`.
///
/// Files are taken in name order and numbered sequentially; titles from
/// the identification are appended when available.
pub async fn organize_tv_files(
    output_dir: &Path,
    tv_root: &Path,
    series: &str,
    season: u32,
    episode_titles: &[String],
) -> Result<PathBuf> {
    let files = mkv_files(output_dir).await?;
    if files.is_empty() {
        return Err(Error::rip(format!(
            "No mkv files found in {}",
            output_dir.display()
        )));
    }

    let series_folder = sanitize_folder_name(series);
    let season_dir = tv_root
        .join(&series_folder)
        .join(format!("Season {:02}", season));
    tokio::fs::create_dir_all(&season_dir).await?;

    for (index, file) in files.iter().enumerate() {
        let episode = index + 1;
        let title = episode_titles.get(index).map(|t| sanitize_folder_name(t));
        let name = match title.filter(|t| !t.is_empty()) {
            Some(title) => format!(
                "{} - S{:02}E{:02} - {}.mkv",
                series_folder, season, episode, title
            ),
            None => format!("{} - S{:02}E{:02}.mkv", series_folder, season, episode),
        };
        let dest = season_dir.join(&name);
        debug!(from = %file.display(), to = %dest.display(), "Placing episode");
        move_file(file, &dest).await?;
    }

    remove_emptied_dir(output_dir).await;
    info!(
        season_dir = %season_dir.display(),
        episodes = files.len(),
        "TV episodes organized"
    );
    Ok(season_dir)
}

/// Sidecar written next to rips held for manual review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub disc_label: String,
    pub fallback_title: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_minutes: Option<u32>,
    pub size_gb: f64,
    pub files: Vec<String>,
}

/// Name of the review sidecar file.
pub const REVIEW_METADATA_FILE: &str = "review_metadata.json";

/// Move a rip the identifier was not confident about into the review
/// holding area and write a metadata sidecar for the human who will sort
/// it out.
pub async fn move_to_review(
    output_dir: &Path,
    review_root: &Path,
    job_id: &str,
    disc_label: &str,
    mut metadata: ReviewMetadata,
) -> Result<PathBuf> {
    let folder = format!("{}_{}", job_id, sanitize_folder_name(disc_label));
    let target = review_root.join(folder);
    tokio::fs::create_dir_all(&target).await?;

    let files = mkv_files(output_dir).await?;
    let mut moved_names = Vec::with_capacity(files.len());
    for file in &files {
        let Some(name) = file.file_name() else {
            continue;
        };
        move_file(file, &target.join(name)).await?;
        moved_names.push(name.to_string_lossy().to_string());
    }
    metadata.files = moved_names;

    let sidecar = target.join(REVIEW_METADATA_FILE);
    tokio::fs::write(&sidecar, serde_json::to_string_pretty(&metadata)?).await?;

    if output_dir != target {
        remove_emptied_dir(output_dir).await;
    }
    info!(target = %target.display(), "Rip moved to review");
    Ok(target)
}

/// Find the directory a rip landed in when makemkvcon never announced it.
///
/// Tries label-derived names under the staging root first, then falls
/// back to the newest staging directory containing an mkv modified within
/// `window`.
pub async fn find_rip_output(
    raw_root: &Path,
    disc_label: &str,
    window: Duration,
) -> Option<PathBuf> {
    let candidates = [
        disc_label.to_string(),
        sanitize_folder_name(disc_label),
        disc_label.replace(' ', "_"),
    ];
    for candidate in &candidates {
        if candidate.is_empty() {
            continue;
        }
        let path = raw_root.join(candidate);
        if path.is_dir() {
            return Some(path);
        }
    }

    let cutoff = SystemTime::now().checked_sub(window)?;
    let mut best: Option<(PathBuf, SystemTime)> = None;
    let mut entries = tokio::fs::read_dir(raw_root).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Ok(files) = mkv_files(&dir).await else {
            continue;
        };
        for file in files {
            let Ok(meta) = tokio::fs::metadata(&file).await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified >= cutoff
                && best
                    .as_ref()
                    .is_none_or(|(_, best_time)| modified > *best_time)
            {
                best = Some((dir.clone(), modified));
            }
        }
    }
    best.map(|(dir, _)| dir)
}
