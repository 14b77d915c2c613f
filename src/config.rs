use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::xdg;

pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// User settings from `$XDG_CONFIG_HOME/devshell/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where fetched inputs are mirrored and unpacked.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Root for package out paths.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    /// Shell syntax used by `devshell env` when `--shell` is not given.
    #[serde(default)]
    pub default_shell: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            store_dir: None,
            default_shell: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    /// Load the user config from its XDG location.
    pub fn load_default() -> Result<Self> {
        Self::load(&xdg::config_dir()?.join(CONFIG_FILE))
    }

    /// `DEVSHELL_CACHE_DIR`, then `cache_dir`, then `$XDG_CACHE_HOME/devshell`.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match override_dir("DEVSHELL_CACHE_DIR", self.cache_dir.as_deref())? {
            Some(dir) => Ok(dir),
            None => xdg::cache_dir(),
        }
    }

    /// `DEVSHELL_STORE_DIR`, then `store_dir`, then `$XDG_DATA_HOME/devshell/store`.
    pub fn store_dir(&self) -> Result<PathBuf> {
        match override_dir("DEVSHELL_STORE_DIR", self.store_dir.as_deref())? {
            Some(dir) => Ok(dir),
            None => Ok(xdg::data_dir()?.join("store")),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

fn override_dir(var: &str, configured: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(value) = env::var_os(var).filter(|value| !value.is_empty()) {
        return Ok(Some(PathBuf::from(value)));
    }

    configured
        .map(|path| {
            let raw = path.to_string_lossy();
            shellexpand::full(&raw)
                .map(|expanded| PathBuf::from(expanded.as_ref()))
                .with_context(|| format!("Failed to expand configured path {:?}", path))
        })
        .transpose()
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}
