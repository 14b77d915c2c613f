use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use url::Url;
use walkdir::{DirEntry, WalkDir};

use crate::error::Error;
use crate::registry::{InputRef, Snapshot};

mod archive;
mod git;
mod path;

pub use archive::ArchiveFormat;

/// Where an input's file tree lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// A local directory, already made absolute.
    Path(PathBuf),
    /// A git repository (`git+<url>` in manifests).
    Git(Url),
    /// A tarball or zip archive reachable over http(s) or `file://`.
    Archive { url: Url, format: ArchiveFormat },
}

impl Locator {
    /// Parse a manifest `url` value; relative paths resolve against `root`.
    pub fn parse(raw: &str, root: &Path) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("locator is empty");
        }

        if let Some(rest) = raw.strip_prefix("git+") {
            let url = Url::parse(rest).with_context(|| format!("invalid git url '{rest}'"))?;
            return match url.scheme() {
                "file" | "http" | "https" | "ssh" => Ok(Locator::Git(url)),
                other => bail!("unsupported git transport '{other}'"),
            };
        }

        if let Some(rest) = raw.strip_prefix("path:") {
            return Ok(Locator::Path(expand_path(rest, root)?));
        }

        if raw.contains("://") {
            let url = Url::parse(raw).with_context(|| format!("invalid url '{raw}'"))?;
            if !matches!(url.scheme(), "file" | "http" | "https") {
                bail!("unsupported locator scheme '{}'", url.scheme());
            }
            let Some(format) = ArchiveFormat::from_name(url.path()) else {
                bail!("unsupported locator '{raw}' (expected an archive or a git+ url)");
            };
            return Ok(Locator::Archive { url, format });
        }

        Ok(Locator::Path(expand_path(raw, root)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Locator::Path(_) => "path",
            Locator::Git(_) => "git",
            Locator::Archive { .. } => "archive",
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Path(path) => write!(f, "path:{}", path.display()),
            Locator::Git(url) => write!(f, "git+{url}"),
            Locator::Archive { url, .. } => write!(f, "{url}"),
        }
    }
}

fn expand_path(raw: &str, root: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .with_context(|| format!("failed to expand path '{raw}'"))?;
    let path = PathBuf::from(expanded.as_ref());
    let joined = if path.is_absolute() {
        path
    } else {
        root.join(path)
    };
    Ok(normalize(&joined))
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Realizes an input into an immutable snapshot on disk.
///
/// Implementations may block on network or filesystem access.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, input: &InputRef) -> Result<Snapshot, Error>;
}

/// Fetcher used by the CLI: dispatches on the locator kind and materializes
/// snapshots under a cache directory.
#[derive(Debug, Clone)]
pub struct DefaultFetcher {
    cache_dir: PathBuf,
    http_timeout: Duration,
}

impl DefaultFetcher {
    pub fn new(cache_dir: PathBuf, http_timeout: Duration) -> Self {
        Self {
            cache_dir,
            http_timeout,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl Fetcher for DefaultFetcher {
    fn fetch(&self, input: &InputRef) -> Result<Snapshot, Error> {
        let pinned = input.pinned_revision.as_deref();
        let result = match &input.locator {
            Locator::Path(dir) => path::fetch(&self.cache_dir, dir, pinned),
            Locator::Git(url) => git::fetch(&self.cache_dir, &input.name, url, pinned),
            Locator::Archive { url, format } => {
                archive::fetch(&self.cache_dir, url, *format, pinned, self.http_timeout)
            }
        };

        result
            .map(|fetched| Snapshot {
                input: input.name.clone(),
                locator: input.locator.to_string(),
                revision: fetched.revision,
                digest: fetched.digest,
                root: fetched.root,
            })
            .map_err(|err| Error::unresolvable(&input.name, &input.locator, format!("{err:#}")))
    }
}

/// Result of a backend fetch before it is tied to an input name.
pub(crate) struct Fetched {
    pub revision: String,
    pub digest: String,
    pub root: PathBuf,
}

/// Content digest of a file tree: `sha256-<hex>`.
///
/// Entries are visited in sorted order; each contributes its relative path, an
/// executable flag and its contents (or link target), so the digest only
/// depends on what is in the tree. `.git` directories are skipped.
pub fn tree_digest(root: &Path) -> Result<String> {
    tree_digest_filtered(root, |_| true)
}

/// Like [`tree_digest`], skipping entries (and whole directories) rejected by `keep`.
pub(crate) fn tree_digest_filtered(root: &Path, keep: impl Fn(&DirEntry) -> bool) -> Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git" && keep(entry));

    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {:?}", root))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .context("walked outside of snapshot root")?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let file_type = entry.file_type();

        if file_type.is_dir() {
            hasher.update(b"d\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("failed to read link {:?}", entry.path()))?;
            hasher.update(b"l\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else {
            hasher.update(if is_executable(entry.path())? { b"x\0" } else { b"f\0" });
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hash_file(&mut hasher, entry.path())?;
            hasher.update(b"\0");
        }
    }

    Ok(format!("sha256-{}", hex::encode(hasher.finalize())))
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {:?} for hashing", path))?;
    let mut buffer = [0u8; 8192];

    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {:?} while hashing", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path).with_context(|| format!("failed to stat {:?}", path))?;
    Ok(metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Result<bool> {
    Ok(false)
}

/// Whether a pinned revision names `digest`; abbreviated pins of at least
/// seven hex characters are accepted, with or without the `sha256-` prefix.
pub(crate) fn pin_matches_digest(pin: &str, digest: &str) -> bool {
    let pin = pin.trim().to_ascii_lowercase();
    let pin = pin.strip_prefix("sha256-").unwrap_or(&pin);
    let digest = digest.strip_prefix("sha256-").unwrap_or(digest);
    pin.len() >= 7 && digest.starts_with(pin)
}

pub(crate) fn sanitize_component(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => result.push(ch),
            _ => result.push('-'),
        }
    }

    if result.trim_matches('-').is_empty() {
        "default".to_string()
    } else {
        result
    }
}

/// Short stable key for cache directories derived from a url.
pub(crate) fn url_key(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    hex::encode(&digest[..8])
}
