//! Runtime configuration.
//!
//! Loaded from `config.json` in the platform config directory, or from the
//! path named by `VOXGATE_CONFIG`. Every field has a default, so a missing
//! file (or a partial one) is fine.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "VOXGATE_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
}

/// Output sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Container/codec of streamed chunks, used as a decoder hint.
    pub stream_mime: String,
    /// Output volume (0.0 to 1.0).
    pub volume: f32,
    /// Timeout for fetching `http(s)` resources.
    pub fetch_timeout_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stream_mime: "audio/mpeg".to_string(),
            volume: 0.85,
            fetch_timeout_secs: 30,
        }
    }
}

impl PlaybackConfig {
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Input device settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// MIME type reported for finished recordings.
    pub mime_type: String,
    /// Stop a recording automatically after this many seconds.
    pub max_duration_secs: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mime_type: "audio/wav".to_string(),
            max_duration_secs: None,
        }
    }
}

impl CaptureConfig {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load from `VOXGATE_CONFIG` or the default location.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path)),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => {
                    debug!("No config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Load and validate a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        let config = Self::from_json(&raw)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("Malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path for this platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "voxgate", "voxgate").map(|d| d.config_dir().join("config.json"))
    }

    /// Reject values the devices cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.playback.volume) {
            return Err(Error::Config(format!(
                "playback.volume must be within 0.0..=1.0, got {}",
                self.playback.volume
            )));
        }
        if self.playback.fetch_timeout_secs == 0 {
            return Err(Error::Config(
                "playback.fetch_timeout_secs must be positive".to_string(),
            ));
        }
        if self.capture.max_duration_secs == Some(0) {
            return Err(Error::Config(
                "capture.max_duration_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
