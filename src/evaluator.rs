use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::package::{Origin, PackageDef, PackageFields, PackageSet};
use crate::platform::PlatformId;

/// Activation keys owned by the evaluator; package `env` entries cannot set them.
pub const RESERVED_KEYS: &[&str] = &["PATH", "MANPATH", "DEVSHELL_PLATFORM", "DEVSHELL_PACKAGES"];

/// Placeholder in package `env` values replaced by the package's out path.
const OUT_PLACEHOLDER: &str = "${out}";

/// A requested package resolved against a package set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageRef {
    /// Name as requested (an alias keeps the alias name here).
    pub name: String,
    /// Name of the definition the request resolved to.
    pub package: String,
    pub version: String,
    pub origin: String,
    pub out_path: PathBuf,
    pub bin: Vec<String>,
    pub outputs: Vec<String>,
}

/// Ordered packages plus the metadata needed to activate a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentDescriptor {
    pub platform: PlatformId,
    pub packages: Vec<PackageRef>,
    pub activation: BTreeMap<String, String>,
}

impl EnvironmentDescriptor {
    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(|package| package.name.as_str())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Turns package requests into environment descriptors.
#[derive(Debug, Clone)]
pub struct Evaluator {
    store_dir: PathBuf,
}

impl Evaluator {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Resolve `requested` against `set`.
    ///
    /// Repeated names collapse to their first occurrence. Either every name
    /// resolves, in request order, or the call fails without a descriptor.
    pub fn evaluate(&self, set: &PackageSet, requested: &[String]) -> Result<EnvironmentDescriptor> {
        let platform = set.platform();
        let mut seen = HashSet::new();
        let requested: Vec<&str> = requested
            .iter()
            .map(String::as_str)
            .filter(|name| seen.insert(*name))
            .collect();

        let missing: Vec<String> = requested
            .iter()
            .filter(|name| !set.contains(name))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::UnknownPackage {
                platform: platform.to_string(),
                names: missing,
            });
        }

        let mut packages = Vec::with_capacity(requested.len());
        for name in requested {
            let def = set.get(name).ok_or_else(|| Error::UnknownPackage {
                platform: platform.to_string(),
                names: vec![name.to_string()],
            })?;
            packages.push(self.package_ref(platform, name, def)?);
        }

        let activation = activation(platform, &packages, set);
        debug!(%platform, packages = packages.len(), "evaluated environment");

        Ok(EnvironmentDescriptor {
            platform: platform.clone(),
            packages,
            activation,
        })
    }

    fn package_ref(&self, platform: &PlatformId, name: &str, def: &PackageDef) -> Result<PackageRef> {
        let invalid = |reason: String| Error::InvalidPackage {
            platform: platform.to_string(),
            name: name.to_string(),
            reason,
        };

        let version = def.validate().map_err(invalid)?.to_string();
        let hash = out_hash(platform, def).map_err(|err| invalid(err.to_string()))?;

        Ok(PackageRef {
            name: name.to_string(),
            package: def.name.clone(),
            out_path: self
                .store_dir
                .join(format!("{hash}-{}-{version}", def.name)),
            version,
            origin: def.origin.to_string(),
            bin: def.fields.bin.clone().unwrap_or_default(),
            outputs: def.fields.effective_outputs(),
        })
    }
}

#[derive(Serialize)]
struct OutPathKey<'a> {
    platform: &'a PlatformId,
    name: &'a str,
    fields: &'a PackageFields,
    origin: &'a Origin,
}

/// First 32 hex characters of the sha256 of the definition's canonical JSON.
fn out_hash(platform: &PlatformId, def: &PackageDef) -> serde_json::Result<String> {
    let key = OutPathKey {
        platform,
        name: &def.name,
        fields: &def.fields,
        origin: &def.origin,
    };
    let canonical = serde_json::to_vec(&key)?;
    let digest = hex::encode(Sha256::digest(&canonical));
    Ok(digest[..32].to_string())
}

fn activation(
    platform: &PlatformId,
    packages: &[PackageRef],
    set: &PackageSet,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    for package in packages {
        let Some(env) = set.get(&package.name).and_then(|def| def.fields.env.as_ref()) else {
            continue;
        };
        let out = package.out_path.to_string_lossy();
        for (key, value) in env {
            if RESERVED_KEYS.contains(&key.as_str()) {
                warn!(package = %package.name, %key, "ignoring reserved activation variable");
                continue;
            }
            vars.insert(key.clone(), value.replace(OUT_PLACEHOLDER, &out));
        }
    }

    let bin_dirs = join_dirs(packages, |p| !p.bin.is_empty(), "bin");
    if !bin_dirs.is_empty() {
        vars.insert("PATH".to_string(), bin_dirs);
    }

    let man_dirs = join_dirs(packages, |p| p.outputs.iter().any(|o| o == "man"), "share/man");
    if !man_dirs.is_empty() {
        vars.insert("MANPATH".to_string(), man_dirs);
    }

    vars.insert("DEVSHELL_PLATFORM".to_string(), platform.to_string());
    vars.insert(
        "DEVSHELL_PACKAGES".to_string(),
        packages
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(" "),
    );

    vars
}

fn join_dirs(packages: &[PackageRef], include: impl Fn(&PackageRef) -> bool, suffix: &str) -> String {
    let mut dirs: Vec<String> = Vec::new();
    for package in packages.iter().filter(|p| include(p)) {
        let dir = package.out_path.join(suffix).to_string_lossy().into_owned();
        // Aliases share an out path with their target.
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs.join(":")
}
