use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::platform::PlatformId;

/// Outputs a package may expose to an activated shell.
pub const KNOWN_OUTPUTS: &[&str] = &["bin", "man", "lib", "include", "share", "doc"];

/// Partially specified package fields.
///
/// Fields stay optional so later layers can override individual values:
/// lists replace wholesale (an explicit empty list clears the previous value),
/// `env` maps merge key by key.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

impl PackageFields {
    /// Merge values from a higher-precedence layer.
    pub fn apply(&mut self, other: &PackageFields) {
        if let Some(version) = &other.version {
            self.version = Some(version.clone());
        }

        if let Some(description) = &other.description {
            self.description = Some(description.clone());
        }

        if let Some(bin) = &other.bin {
            self.bin = Some(bin.clone());
        }

        if let Some(outputs) = &other.outputs {
            self.outputs = Some(outputs.clone());
        }

        if let Some(env) = &other.env {
            self.env
                .get_or_insert_with(BTreeMap::new)
                .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    /// Outputs exposed by the package; `bin` is implied by a non-empty `bin` list.
    pub fn effective_outputs(&self) -> Vec<String> {
        let mut outputs = self.outputs.clone().unwrap_or_default();
        let has_bins = self.bin.as_ref().is_some_and(|bin| !bin.is_empty());
        if has_bins && !outputs.iter().any(|output| output == "bin") {
            outputs.insert(0, "bin".to_string());
        }
        outputs
    }
}

/// A package as declared in a package file or an inline overlay.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    /// Platforms the package is available on; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<PlatformId>,
    /// Replace an existing definition instead of merging into it.
    #[serde(default)]
    pub replace: bool,
    /// Field overrides that only apply to one platform.
    #[serde(default, rename = "platform", skip_serializing_if = "BTreeMap::is_empty")]
    pub per_platform: BTreeMap<PlatformId, PackageFields>,
}

impl PackageDecl {
    fn fields(&self) -> PackageFields {
        PackageFields {
            version: self.version.clone(),
            description: self.description.clone(),
            bin: self.bin.clone(),
            outputs: self.outputs.clone(),
            env: self.env.clone(),
        }
    }

    pub fn applies_to(&self, platform: &PlatformId) -> bool {
        self.platforms.is_empty() || self.platforms.contains(platform)
    }

    /// Fields for `platform`, or `None` when the package is not available there.
    pub fn instantiate(&self, platform: &PlatformId) -> Option<PackageFields> {
        if !self.applies_to(platform) {
            return None;
        }

        let mut fields = self.fields();
        if let Some(overrides) = self.per_platform.get(platform) {
            fields.apply(overrides);
        }
        Some(fields)
    }
}

/// Where a package definition came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Origin {
    /// A package file inside a resolved input snapshot.
    Input { name: String, digest: String },
    /// An inline `kind = "packages"` overlay, by position in the manifest.
    Inline { overlay: usize },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Input { name, digest } => write!(f, "input:{name}@{digest}"),
            Origin::Inline { overlay } => write!(f, "overlay#{overlay}"),
        }
    }
}

/// A package definition instantiated for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageDef {
    pub name: String,
    pub fields: PackageFields,
    pub origin: Origin,
}

impl PackageDef {
    /// Check that the definition can be used in an environment.
    ///
    /// Overlays may leave definitions incomplete; this runs only for packages
    /// that are actually requested.
    pub fn validate(&self) -> std::result::Result<&str, String> {
        let version = match self.fields.version.as_deref().map(str::trim) {
            Some(version) if !version.is_empty() => version,
            _ => return Err("missing required field 'version'".to_string()),
        };
        // The version becomes part of the out path.
        if version.contains(['/', '\\'])
            || version.contains("..")
            || version.contains(char::is_whitespace)
        {
            return Err(format!("invalid version '{version}'"));
        }

        for bin in self.fields.bin.iter().flatten() {
            if bin.is_empty() || bin.contains('/') {
                return Err(format!("invalid executable name '{bin}'"));
            }
        }

        for output in self.fields.outputs.iter().flatten() {
            if !KNOWN_OUTPUTS.contains(&output.as_str()) {
                return Err(format!("unknown output '{output}'"));
            }
        }

        for key in self.fields.env.iter().flat_map(|env| env.keys()) {
            if !env_key_pattern().is_match(key) {
                return Err(format!("invalid environment variable name '{key}'"));
            }
        }

        Ok(version)
    }
}

fn env_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env key regex"))
}

fn package_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*$").expect("valid package name regex")
    })
}

pub fn is_valid_package_name(name: &str) -> bool {
    package_name_pattern().is_match(name)
}

/// The full mapping from package name to definition for a single platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSet {
    platform: PlatformId,
    packages: BTreeMap<String, PackageDef>,
}

impl PackageSet {
    pub fn empty(platform: PlatformId) -> Self {
        Self {
            platform,
            packages: BTreeMap::new(),
        }
    }

    /// Instantiate declarations for `platform`, dropping packages unavailable there.
    pub fn from_decls(
        platform: PlatformId,
        origin: &Origin,
        decls: &BTreeMap<String, PackageDecl>,
    ) -> Self {
        let packages = decls
            .iter()
            .filter_map(|(name, decl)| {
                decl.instantiate(&platform).map(|fields| {
                    (
                        name.clone(),
                        PackageDef {
                            name: name.clone(),
                            fields,
                            origin: origin.clone(),
                        },
                    )
                })
            })
            .collect();

        Self { platform, packages }
    }

    pub fn platform(&self) -> &PlatformId {
        &self.platform
    }

    pub fn get(&self, name: &str) -> Option<&PackageDef> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Entries by name; an alias yields its own name with the target's definition.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PackageDef)> {
        self.packages.iter().map(|(name, def)| (name.as_str(), def))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub(crate) fn insert(&mut self, name: String, def: PackageDef) {
        self.packages.insert(name, def);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<PackageDef> {
        self.packages.remove(name)
    }
}

/// Package file shipped inside an input snapshot (`packages.toml` by default).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageFile {
    #[serde(default)]
    pub packages: BTreeMap<String, PackageDecl>,
}

impl PackageFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| Error::Manifest {
            path: path.to_path_buf(),
            reason: format!("failed to read package file: {err}"),
        })?;

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        let file: PackageFile = toml::from_str(&contents).map_err(|err| Error::Manifest {
            path: path.to_path_buf(),
            reason: format!("failed to parse package file: {err}"),
        })?;

        if let Some(name) = file.packages.keys().find(|name| !is_valid_package_name(name)) {
            return Err(Error::Manifest {
                path: path.to_path_buf(),
                reason: format!("invalid package name '{name}'"),
            });
        }

        Ok(file)
    }
}
