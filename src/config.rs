use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::paths::config_file_path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub player_bin: PathBuf,
    pub audio_preference: String,
    pub tracking_enabled: bool,
    pub tracker_token: Option<String>,
    pub tracker_endpoint: String,
    /// Watched fraction at or above which progress is pushed to the tracker
    /// immediately instead of being queued.
    pub sync_threshold: f64,
    pub poll_interval_ms: u64,
    pub query_timeout_ms: u64,
    pub launch_timeout_ms: u64,
    pub ipc_grace_ms: u64,
    pub drain_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            player_bin: PathBuf::from("mpv"),
            audio_preference: "sub".to_string(),
            tracking_enabled: true,
            tracker_token: None,
            tracker_endpoint: "https://graphql.anilist.co".to_string(),
            sync_threshold: 0.85,
            poll_interval_ms: 1_000,
            query_timeout_ms: 5_000,
            launch_timeout_ms: 15_000,
            ipc_grace_ms: 10_000,
            drain_batch: 100,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_file_path()?;
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| env::var_os(key));
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config at {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.sync_threshold > 0.0 && self.sync_threshold <= 1.0,
            "sync_threshold must be in (0, 1], got {}",
            self.sync_threshold
        );
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("query_timeout_ms", self.query_timeout_ms),
            ("launch_timeout_ms", self.launch_timeout_ms),
        ] {
            ensure!(value > 0, "{name} must be greater than zero");
        }
        ensure!(self.drain_batch > 0, "drain_batch must be greater than zero");
        Ok(())
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(bin) = non_empty("PLAYTRACK_PLAYER_BIN") {
            self.player_bin = PathBuf::from(bin);
        }
        if let Some(token) = non_empty("PLAYTRACK_TRACKER_TOKEN") {
            self.tracker_token = Some(token.to_string_lossy().into_owned());
        }
        if let Some(audio) = non_empty("PLAYTRACK_AUDIO") {
            self.audio_preference = audio.to_string_lossy().trim().to_lowercase();
        }
        if let Some(flag) = non_empty("PLAYTRACK_TRACKING") {
            self.tracking_enabled = !matches!(
                flag.to_string_lossy().trim().to_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn ipc_grace(&self) -> Duration {
        Duration::from_millis(self.ipc_grace_ms)
    }
}
