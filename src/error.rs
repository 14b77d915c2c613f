use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving inputs and evaluating shell environments.
///
/// Every variant is terminal for the operation that produced it and carries
/// enough context (input name, locator, platform, package names) to fix the
/// manifest that caused it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("input '{name}' is already registered")]
    DuplicateName { name: String },

    #[error("unable to resolve input '{name}' from {locator}: {reason}")]
    UnresolvableInput {
        name: String,
        locator: String,
        reason: String,
    },

    #[error("platform '{platform}' is not supported (supported: {})", .supported.join(", "))]
    UnsupportedPlatform {
        platform: String,
        supported: Vec<String>,
    },

    #[error("unknown package{} {} for {platform}", plural(.names.len()), quoted(.names))]
    UnknownPackage {
        platform: String,
        names: Vec<String>,
    },

    #[error("package '{name}' is invalid for {platform}: {reason}")]
    InvalidPackage {
        platform: String,
        name: String,
        reason: String,
    },

    #[error("invalid platform identifier '{0}' (expected <arch>-<os>)")]
    InvalidPlatform(String),

    #[error("manifest {path:?}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn unresolvable(
        name: impl Into<String>,
        locator: impl ToString,
        reason: impl ToString,
    ) -> Self {
        Error::UnresolvableInput {
            name: name.into(),
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short, stable name of the error kind for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DuplicateName { .. } => "duplicate-name",
            Error::UnresolvableInput { .. } => "unresolvable-input",
            Error::UnsupportedPlatform { .. } => "unsupported-platform",
            Error::UnknownPackage { .. } => "unknown-package",
            Error::InvalidPackage { .. } => "invalid-package",
            Error::InvalidPlatform(_) => "invalid-platform",
            Error::Manifest { .. } => "manifest",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_package_lists_every_name() {
        let error = Error::UnknownPackage {
            platform: "x86_64-linux".to_string(),
            names: vec!["bar".to_string(), "baz".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "unknown packages 'bar', 'baz' for x86_64-linux"
        );
        assert_eq!(error.kind(), "unknown-package");
    }

    #[test]
    fn unsupported_platform_names_supported_set() {
        let error = Error::UnsupportedPlatform {
            platform: "riscv64-windows".to_string(),
            supported: vec!["x86_64-linux".to_string(), "aarch64-darwin".to_string()],
        };
        let message = error.to_string();
        assert!(message.contains("riscv64-windows"));
        assert!(message.contains("x86_64-linux, aarch64-darwin"));
    }

    #[test]
    fn unresolvable_input_carries_locator() {
        let error = Error::unresolvable("nixpkgs", "git+https://example.com/pkgs", "timed out");
        assert_eq!(
            error.to_string(),
            "unable to resolve input 'nixpkgs' from git+https://example.com/pkgs: timed out"
        );
    }
}
