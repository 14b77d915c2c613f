use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

const APP_DIR: &str = "devshell";

fn base_dir(var: &str, fallback: &str) -> Result<PathBuf> {
    if let Some(value) = env::var_os(var).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(value));
    }

    let base_dirs = directories::BaseDirs::new().context("Failed to get home directory")?;
    Ok(base_dirs.home_dir().join(fallback))
}

/// `$XDG_CONFIG_HOME/devshell`, defaulting to `~/.config/devshell`
pub fn config_dir() -> Result<PathBuf> {
    Ok(base_dir("XDG_CONFIG_HOME", ".config")?.join(APP_DIR))
}

/// `$XDG_CACHE_HOME/devshell`, defaulting to `~/.cache/devshell`
pub fn cache_dir() -> Result<PathBuf> {
    Ok(base_dir("XDG_CACHE_HOME", ".cache")?.join(APP_DIR))
}

/// `$XDG_DATA_HOME/devshell`, defaulting to `~/.local/share/devshell`
pub fn data_dir() -> Result<PathBuf> {
    Ok(base_dir("XDG_DATA_HOME", ".local/share")?.join(APP_DIR))
}
