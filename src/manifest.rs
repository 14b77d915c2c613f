use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::fetch::Locator;
use crate::overlay::AliasSource;
use crate::package::{is_valid_package_name, PackageDecl};
use crate::platform::{default_systems, PlatformId};

/// Manifest file name looked up in the working directory.
pub const MANIFEST_FILE: &str = "devshell.toml";

/// Package file read from an input snapshot when `file` is not given.
pub const DEFAULT_PACKAGE_FILE: &str = "packages.toml";

pub const DEFAULT_SHELL: &str = "default";

/// A named input source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDecl {
    /// Locator string (`path:`, `git+…`, or an archive url).
    pub url: String,
    /// Pinned revision: commit, branch, tag, or content digest prefix.
    #[serde(default)]
    pub rev: Option<String>,
    /// Package file inside the snapshot.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl InputDecl {
    pub fn file(&self) -> PathBuf {
        self.file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PACKAGE_FILE))
    }
}

/// One entry of the `[[overlays]]` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OverlayDecl {
    /// Packages from another input's package file.
    Input {
        input: String,
        #[serde(default)]
        file: Option<PathBuf>,
    },
    /// Packages declared inline.
    Packages {
        packages: BTreeMap<String, PackageDecl>,
    },
    Alias {
        #[serde(default)]
        from: AliasSource,
        aliases: BTreeMap<String, String>,
    },
    Remove { packages: Vec<String> },
}

impl OverlayDecl {
    pub fn kind(&self) -> &'static str {
        match self {
            OverlayDecl::Input { .. } => "input",
            OverlayDecl::Packages { .. } => "packages",
            OverlayDecl::Alias { .. } => "alias",
            OverlayDecl::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellDecl {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Parsed `devshell.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub systems: Option<Vec<String>>,
    /// Input whose package file provides the base set.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDecl>,
    #[serde(default)]
    pub overlays: Vec<OverlayDecl>,
    #[serde(default)]
    pub shells: BTreeMap<String, ShellDecl>,
    #[serde(skip)]
    path: PathBuf,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| Error::Manifest {
            path: path.to_path_buf(),
            reason: format!("failed to read manifest: {err}"),
        })?;

        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self> {
        let mut manifest: Manifest = toml::from_str(contents).map_err(|err| Error::Manifest {
            path: path.to_path_buf(),
            reason: format!("failed to parse manifest: {err}"),
        })?;
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative locators resolve against.
    pub fn root(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Supported platforms in declaration order, without duplicates.
    pub fn systems(&self) -> Result<Vec<PlatformId>> {
        let Some(systems) = &self.systems else {
            return Ok(default_systems());
        };

        let mut parsed: Vec<PlatformId> = Vec::with_capacity(systems.len());
        for system in systems {
            let platform = PlatformId::parse(system)?;
            if !parsed.contains(&platform) {
                parsed.push(platform);
            }
        }
        Ok(parsed)
    }

    pub fn shell(&self, name: &str) -> Result<&ShellDecl> {
        self.shells.get(name).ok_or_else(|| Error::Manifest {
            path: self.path.clone(),
            reason: if self.shells.is_empty() {
                format!("no shell named '{name}' (the manifest defines no shells)")
            } else {
                format!(
                    "no shell named '{name}' (available: {})",
                    self.shells.keys().cloned().collect::<Vec<_>>().join(", ")
                )
            },
        })
    }

    /// Report every problem that can be found without resolving inputs.
    pub fn validate(&self) -> Vec<ManifestIssue> {
        let mut issues = Vec::new();

        match &self.systems {
            Some(systems) if systems.is_empty() => {
                issues.push(ManifestIssue::new("systems", "at least one platform is required"));
            }
            Some(systems) => {
                for system in systems {
                    if let Err(err) = PlatformId::parse(system) {
                        issues.push(ManifestIssue::new("systems", err.to_string()));
                    }
                }
            }
            None => {}
        }

        if let Some(base) = &self.base {
            if !self.inputs.contains_key(base) {
                issues.push(ManifestIssue::new(
                    "base",
                    format!("refers to undeclared input '{base}'"),
                ));
            }
        }

        for (name, input) in &self.inputs {
            let subject = format!("inputs.{name}");
            if !is_valid_package_name(name) {
                issues.push(ManifestIssue::new(&subject, "invalid input name"));
            }
            if let Err(err) = Locator::parse(&input.url, self.root()) {
                issues.push(ManifestIssue::new(&subject, format!("{err:#}")));
            }
            if input.rev.as_deref().is_some_and(|rev| rev.trim().is_empty()) {
                issues.push(ManifestIssue::new(&subject, "rev must not be empty"));
            }
            if let Some(file) = &input.file {
                check_relative_file(&subject, file, &mut issues);
            }
        }

        for (index, overlay) in self.overlays.iter().enumerate() {
            let subject = format!("overlays[{index}]");
            match overlay {
                OverlayDecl::Input { input, file } => {
                    if !self.inputs.contains_key(input) {
                        issues.push(ManifestIssue::new(
                            &subject,
                            format!("refers to undeclared input '{input}'"),
                        ));
                    }
                    if let Some(file) = file {
                        check_relative_file(&subject, file, &mut issues);
                    }
                }
                OverlayDecl::Packages { packages } => {
                    for name in packages.keys().filter(|n| !is_valid_package_name(n)) {
                        issues.push(ManifestIssue::new(
                            &subject,
                            format!("invalid package name '{name}'"),
                        ));
                    }
                }
                OverlayDecl::Alias { aliases, .. } => {
                    for (alias, target) in aliases {
                        if !is_valid_package_name(alias) {
                            issues.push(ManifestIssue::new(
                                &subject,
                                format!("invalid alias name '{alias}'"),
                            ));
                        }
                        if alias == target {
                            issues.push(ManifestIssue::new(
                                &subject,
                                format!("alias '{alias}' points to itself"),
                            ));
                        }
                    }
                }
                OverlayDecl::Remove { packages } => {
                    if packages.is_empty() {
                        issues.push(ManifestIssue::new(&subject, "removes no packages"));
                    }
                }
            }
        }

        for (name, shell) in &self.shells {
            let subject = format!("shells.{name}");
            for package in shell.packages.iter().filter(|p| !is_valid_package_name(p)) {
                issues.push(ManifestIssue::new(
                    &subject,
                    format!("invalid package name '{package}'"),
                ));
            }
        }

        issues
    }
}

fn check_relative_file(subject: &str, file: &Path, issues: &mut Vec<ManifestIssue>) {
    let escapes = file
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || file.as_os_str().is_empty() {
        issues.push(ManifestIssue::new(
            subject,
            format!("file {:?} must be a relative path inside the input", file),
        ));
    }
}

/// A problem found by [`Manifest::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIssue {
    pub subject: String,
    pub message: String,
}

impl ManifestIssue {
    fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ManifestIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}
