use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::registry::Snapshot;

pub const LOCKFILE_NAME: &str = "devshell.lock";

const LOCKFILE_VERSION: u32 = 1;

/// Contents of `devshell.lock`.
/// Records the revision and content digest each input resolved to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    /// Version of the lockfile format
    version: u32,
    /// Metadata about when this was generated
    pub metadata: Metadata,
    /// Resolved inputs, sorted by name
    #[serde(default)]
    inputs: Vec<LockedInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// When the lockfile was last written
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedInput {
    pub name: String,
    /// Locator the revision was resolved from
    pub locator: String,
    pub revision: String,
    pub digest: String,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockfile {
    pub fn new() -> Self {
        Self {
            version: LOCKFILE_VERSION,
            metadata: Metadata {
                generated_at: chrono::Utc::now().to_rfc3339(),
            },
            inputs: Vec::new(),
        }
    }

    /// Load lockfile from disk
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lockfile from {:?}", path))?;

        let lockfile: Lockfile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse lockfile from {:?}", path))?;

        if lockfile.version != LOCKFILE_VERSION {
            bail!(
                "Unsupported lockfile version {} in {:?} (expected {})",
                lockfile.version,
                path,
                LOCKFILE_VERSION
            );
        }

        Ok(lockfile)
    }

    /// Load the lockfile if it exists, otherwise start an empty one.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save lockfile to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lockfile directory {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize lockfile")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write lockfile to {:?}", path))?;

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&LockedInput> {
        self.inputs.iter().find(|entry| entry.name == name)
    }

    /// Record a resolved snapshot, replacing any previous entry for the input.
    pub fn record(&mut self, snapshot: &Snapshot) {
        let entry = LockedInput {
            name: snapshot.input.clone(),
            locator: snapshot.locator.clone(),
            revision: snapshot.revision.clone(),
            digest: snapshot.digest.clone(),
        };

        match self.inputs.binary_search_by(|e| e.name.cmp(&entry.name)) {
            Ok(index) => self.inputs[index] = entry,
            Err(index) => self.inputs.insert(index, entry),
        }
        self.metadata.generated_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn inputs(&self) -> impl Iterator<Item = &LockedInput> {
        self.inputs.iter()
    }

    /// Retain only entries that satisfy the provided predicate.
    pub fn retain<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&LockedInput) -> bool,
    {
        self.inputs.retain(|entry| predicate(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn snapshot(name: &str, revision: &str) -> Snapshot {
        Snapshot {
            input: name.to_string(),
            locator: format!("git+https://example.com/{name}.git"),
            revision: revision.to_string(),
            digest: format!("sha256-{revision}"),
            root: PathBuf::from("/cache").join(name),
        }
    }

    #[test]
    fn test_lockfile_new() {
        let lockfile = Lockfile::new();
        assert_eq!(lockfile.version, LOCKFILE_VERSION);
        assert!(!lockfile.metadata.generated_at.is_empty());
        assert_eq!(lockfile.inputs().count(), 0);
    }

    #[test]
    fn test_lockfile_save_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LOCKFILE_NAME);

        let mut lockfile = Lockfile::new();
        lockfile.record(&snapshot("nixpkgs", "abc123"));
        lockfile.save(&path).unwrap();
        assert!(path.exists());

        let loaded = Lockfile::load(&path).unwrap();
        let entry = loaded.get("nixpkgs").unwrap();
        assert_eq!(entry.revision, "abc123");
        assert_eq!(entry.digest, "sha256-abc123");
        assert_eq!(entry.locator, "git+https://example.com/nixpkgs.git");
    }

    #[test]
    fn test_record_replaces_and_sorts() {
        let mut lockfile = Lockfile::new();
        lockfile.record(&snapshot("rust-overlay", "1111111"));
        lockfile.record(&snapshot("nixpkgs", "abc123"));
        lockfile.record(&snapshot("rust-overlay", "2222222"));

        let names: Vec<_> = lockfile.inputs().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["nixpkgs", "rust-overlay"]);
        assert_eq!(lockfile.get("rust-overlay").unwrap().revision, "2222222");
    }

    #[test]
    fn test_retain() {
        let mut lockfile = Lockfile::new();
        lockfile.record(&snapshot("nixpkgs", "abc123"));
        lockfile.record(&snapshot("stale", "def456"));

        lockfile.retain(|entry| entry.name != "stale");
        assert!(lockfile.get("stale").is_none());
        assert!(lockfile.get("nixpkgs").is_some());
    }

    #[test]
    fn test_load_rejects_other_versions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LOCKFILE_NAME);
        fs::write(
            &path,
            "version = 9\n\n[metadata]\ngenerated_at = \"2024-01-01T00:00:00Z\"\n",
        )
        .unwrap();

        let error = Lockfile::load(&path).unwrap_err();
        assert!(error.to_string().contains("Unsupported lockfile version 9"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let lockfile = Lockfile::load_or_default(&temp.path().join(LOCKFILE_NAME)).unwrap();
        assert_eq!(lockfile.inputs().count(), 0);
    }
}
