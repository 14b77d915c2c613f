use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::{pin_matches_digest, tree_digest_filtered, Fetched};
use crate::lockfile::LOCKFILE_NAME;

/// Copy a local directory into the snapshot cache; its revision is its content digest.
///
/// Lockfiles and the cache directory itself are not part of the snapshot, so a
/// manifest that uses its own directory as an input can be locked.
pub(super) fn fetch(cache_dir: &Path, dir: &Path, pinned: Option<&str>) -> Result<Fetched> {
    if !dir.is_dir() {
        bail!("directory {:?} does not exist", dir);
    }

    let keep = |entry: &DirEntry| belongs_to_snapshot(entry, cache_dir);
    let digest = tree_digest_filtered(dir, keep)?;
    debug!(dir = %dir.display(), %digest, "hashed path input");

    if let Some(pin) = pinned {
        if !pin_matches_digest(pin, &digest) {
            bail!("revision '{pin}' does not match content digest {digest}");
        }
    }

    let hex = digest.trim_start_matches("sha256-");
    let root = cache_dir
        .join("snapshots")
        .join(format!("path-{}", &hex[..32]));
    if root.exists() {
        debug!(root = %root.display(), "reusing path snapshot");
    } else {
        copy_tree(dir, &root, keep)?;
    }

    Ok(Fetched {
        revision: digest.clone(),
        digest,
        root,
    })
}

fn belongs_to_snapshot(entry: &DirEntry, cache_dir: &Path) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    if entry.file_type().is_dir() {
        return !same_dir(entry.path(), cache_dir);
    }
    entry.file_name() != LOCKFILE_NAME
}

fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    if a.file_name() != b.file_name() {
        return false;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Copy the kept entries of `source` into `dest` through a staging directory.
fn copy_tree(source: &Path, dest: &Path, keep: impl Fn(&DirEntry) -> bool) -> Result<()> {
    let staging = dest.with_extension("partial");
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("failed to clear stale copy {:?}", staging))?;
    }

    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git" && keep(entry));

    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {:?}", source))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("walked outside of input directory")?;
        let target: PathBuf = staging.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create directory {:?}", target))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("failed to read link {:?}", entry.path()))?;
            copy_symlink(&link, &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {:?}", entry.path()))?;
        }
    }

    match fs::rename(&staging, dest) {
        Ok(()) => Ok(()),
        // Another process finished the same snapshot first.
        Err(_) if dest.exists() => {
            fs::remove_dir_all(&staging).ok();
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to move copied input into {:?}", dest))
        }
    }
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)
        .with_context(|| format!("failed to create symlink {:?}", target))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    fs::write(target, link.to_string_lossy().as_bytes())
        .with_context(|| format!("failed to write {:?}", target))
}
