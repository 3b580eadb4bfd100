use std::path::PathBuf;

use anyhow::{Context, Result};

const APP_DIR: &str = "playtrack";

pub fn database_file_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("unable to resolve data directory")?;
    Ok(base.join(APP_DIR).join("playtrack.db"))
}

pub fn log_file_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("unable to resolve data directory")?;
    Ok(base.join(APP_DIR).join("playtrack.log"))
}

pub fn config_file_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("unable to resolve config directory")?;
    Ok(base.join(APP_DIR).join("config.json"))
}

/// IPC endpoint handed to mpv via `--input-ipc-server`.
#[cfg(unix)]
pub fn player_ipc_path() -> PathBuf {
    std::env::temp_dir().join(format!("playtrack-mpv-{}.sock", std::process::id()))
}

#[cfg(not(unix))]
pub fn player_ipc_path() -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\playtrack-mpv-{}", std::process::id()))
}
