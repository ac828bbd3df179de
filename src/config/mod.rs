//! Application configuration.
//!
//! Loaded from a JSON file (default `config.json`, overridable via the
//! `AUTORIP_CONFIG` environment variable). Every field has a default so a
//! missing or partial file still yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Environment variable naming the config file path.
pub const CONFIG_PATH_ENV: &str = "AUTORIP_CONFIG";

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Filesystem layout: where rips land and where finished files go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Staging area where makemkvcon writes raw rips.
    pub raw_rips: PathBuf,
    /// Movie library root.
    pub movies: PathBuf,
    /// TV library root.
    pub tv: PathBuf,
    /// Holding area for rips that need manual review.
    pub review: PathBuf,
    /// Directory for job snapshots and other runtime state.
    pub state_dir: PathBuf,
    /// Directory for log files.
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_rips: PathBuf::from("/data/raw"),
            movies: PathBuf::from("/data/movies"),
            tv: PathBuf::from("/data/tv"),
            review: PathBuf::from("/data/review"),
            state_dir: PathBuf::from("/var/lib/autorip"),
            log_dir: PathBuf::from("/var/log/autorip"),
        }
    }
}

/// Ripping behavior and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RippingConfig {
    /// Optical drive device node.
    pub device: String,
    /// Path to the makemkvcon binary.
    pub makemkvcon_path: String,
    /// Minimum title length passed to the disc scanner, in seconds.
    pub min_title_seconds: u64,
    /// A track must be longer than this to qualify as the main feature.
    pub main_feature_min_seconds: u64,
    /// Inclusive lower bound for a track to look like a TV episode.
    pub tv_min_episode_seconds: u64,
    /// Inclusive upper bound for a track to look like a TV episode.
    pub tv_max_episode_seconds: u64,
    /// Free space required on the staging filesystem before ripping, GB.
    pub required_free_gb: u64,
    /// An interrupted rip resumes post-processing when the on-disk output
    /// reaches this percentage of the expected size.
    pub completion_threshold_pct: u8,
    /// When locating a finished rip by label fails, accept the newest
    /// staging directory with an mkv modified within this window.
    pub output_search_window_secs: u64,
    /// Eject the disc after a successful rip.
    pub eject_when_done: bool,
}

impl Default for RippingConfig {
    fn default() -> Self {
        Self {
            device: "/dev/sr0".to_string(),
            makemkvcon_path: "makemkvcon".to_string(),
            min_title_seconds: 120,
            main_feature_min_seconds: 2700,
            tv_min_episode_seconds: 1200,
            tv_max_episode_seconds: 3600,
            required_free_gb: 50,
            completion_threshold_pct: 90,
            output_search_window_secs: 300,
            eject_when_done: false,
        }
    }
}

impl RippingConfig {
    pub fn required_free_bytes(&self) -> u64 {
        self.required_free_gb * 1_000_000_000
    }
}

/// Title identification service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentificationConfig {
    /// Base URL of the identification service; empty disables it.
    pub service_url: String,
    /// API key sent with identification requests.
    pub api_key: String,
    /// Identifications below this confidence go to review.
    pub confidence_threshold: u8,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            api_key: String::new(),
            confidence_threshold: 75,
        }
    }
}

/// Outbound notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotificationsConfig {
    /// URL hit after a successful library move to trigger a rescan;
    /// empty disables it.
    pub rescan_url: String,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8930,
            enable_cors: true,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub ripping: RippingConfig,
    pub identification: IdentificationConfig,
    pub notifications: NotificationsConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Resolve the config file path from the environment.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: AppConfig = serde_json::from_str(&contents)
                    .map_err(|e| Error::config(format!("Invalid config file: {}", e)))?;
                info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the configuration back to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Path of the job snapshot file under the state directory.
    pub fn snapshot_path(&self) -> PathBuf {
        self.paths.state_dir.join("current_job.json")
    }

    /// Path of the rip history file under the state directory.
    pub fn history_path(&self) -> PathBuf {
        self.paths.state_dir.join("history.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.ripping.device, "/dev/sr0");
        assert_eq!(config.ripping.main_feature_min_seconds, 2700);
        assert_eq!(config.ripping.tv_min_episode_seconds, 1200);
        assert_eq!(config.ripping.tv_max_episode_seconds, 3600);
        assert_eq!(config.ripping.required_free_gb, 50);
        assert_eq!(config.ripping.completion_threshold_pct, 90);
        assert_eq!(config.ripping.output_search_window_secs, 300);
        assert_eq!(config.identification.confidence_threshold, 75);
        assert_eq!(config.server.port, 8930);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{"ripping": {"device": "/dev/sr1"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ripping.device, "/dev/sr1");
        assert_eq!(config.ripping.required_free_gb, 50);
        assert_eq!(config.paths.movies, PathBuf::from("/data/movies"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/autorip-config.json")).unwrap();
        assert_eq!(config.ripping.device, "/dev/sr0");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.ripping.eject_when_done = true;
        config.save(&path).unwrap();
        let reloaded = AppConfig::load(&path).unwrap();
        assert!(reloaded.ripping.eject_when_done);
    }
}
