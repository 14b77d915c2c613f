use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::Error;

/// Platforms used when a manifest does not declare `systems`.
pub const DEFAULT_SYSTEMS: &[&str] = &[
    "x86_64-linux",
    "aarch64-linux",
    "x86_64-darwin",
    "aarch64-darwin",
];

/// Target architecture/OS tag such as `x86_64-linux`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformId(String);

impl PlatformId {
    pub fn parse(value: &str) -> Result<Self, Error> {
        let normalized = value.trim().to_ascii_lowercase();
        if platform_pattern().is_match(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(Error::InvalidPlatform(value.to_string()))
        }
    }

    /// Platform of the running host, using the `darwin` spelling for macOS.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self(format!("{}-{}", std::env::consts::ARCH, os))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn arch(&self) -> &str {
        self.0.split_once('-').map(|(arch, _)| arch).unwrap_or(&self.0)
    }

    pub fn os(&self) -> &str {
        self.0.split_once('-').map(|(_, os)| os).unwrap_or_default()
    }
}

fn platform_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+-[a-z0-9]+$").expect("valid platform regex"))
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PlatformId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PlatformId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PlatformId> for String {
    fn from(value: PlatformId) -> Self {
        value.0
    }
}

pub fn default_systems() -> Vec<PlatformId> {
    DEFAULT_SYSTEMS
        .iter()
        .map(|system| PlatformId(system.to_string()))
        .collect()
}
