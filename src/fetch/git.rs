use anyhow::{anyhow, Context, Result};
use git2::{Commit, ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

use super::{sanitize_component, tree_digest, url_key, Fetched};

const FETCH_REFSPECS: &[&str] = &["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Mirror the repository into the cache and materialize the selected commit.
///
/// A pinned commit id (full or abbreviated) already present in the mirror is
/// used without touching the network. Branch and tag pins always fetch first.
pub(super) fn fetch(
    cache_dir: &Path,
    name: &str,
    url: &Url,
    pinned: Option<&str>,
) -> Result<Fetched> {
    let mirror = cache_dir
        .join("git")
        .join(format!("{}-{}", sanitize_component(name), url_key(url)));
    let repo = open_mirror(&mirror)?;

    let commit = match pinned {
        Some(rev) => {
            let known = if is_object_id(rev) {
                find_commit(&repo, rev)
            } else {
                None
            };
            match known {
                Some(commit) => commit,
                None => {
                    update_mirror(&repo, url)?;
                    find_commit(&repo, rev)
                        .ok_or_else(|| anyhow!("revision '{rev}' does not exist in {url}"))?
                }
            }
        }
        None => {
            update_mirror(&repo, url)?;
            repo.head()
                .and_then(|head| head.peel_to_commit())
                .with_context(|| format!("repository {url} has no default branch"))?
        }
    };

    let commit_id = commit.id();
    let root = cache_dir
        .join("snapshots")
        .join(format!("git-{commit_id}"));
    if !root.exists() {
        materialize(&repo, &commit, &root)?;
    } else {
        debug!(commit = %commit_id, "reusing materialized git snapshot");
    }

    let digest = tree_digest(&root)?;
    Ok(Fetched {
        revision: commit_id.to_string(),
        digest,
        root,
    })
}

fn open_mirror(path: &Path) -> Result<Repository> {
    if path.exists() {
        Repository::open_bare(path)
            .with_context(|| format!("failed to open git mirror {:?}", path))
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create git mirror directory {:?}", path))?;
        Repository::init_bare(path)
            .with_context(|| format!("failed to initialize git mirror {:?}", path))
    }
}

fn update_mirror(repo: &Repository, url: &Url) -> Result<()> {
    info!(%url, "fetching git input");
    let mut remote = repo
        .remote_anonymous(url.as_str())
        .with_context(|| format!("invalid git remote {url}"))?;
    remote
        .fetch(FETCH_REFSPECS, None, None)
        .with_context(|| format!("failed to fetch {url}"))?;

    // Point HEAD at the remote's default branch so unpinned inputs follow it.
    let default_branch = remote
        .default_branch()
        .ok()
        .and_then(|buf| buf.as_str().map(str::to_string));
    let candidates = default_branch
        .into_iter()
        .chain(["refs/heads/main".to_string(), "refs/heads/master".to_string()]);

    for candidate in candidates {
        if repo.find_reference(&candidate).is_ok() {
            repo.set_head(&candidate)
                .with_context(|| format!("failed to update HEAD to {candidate}"))?;
            return Ok(());
        }
    }

    Ok(())
}

fn is_object_id(rev: &str) -> bool {
    (7..=40).contains(&rev.len()) && rev.chars().all(|c| c.is_ascii_hexdigit())
}

fn find_commit<'r>(repo: &'r Repository, rev: &str) -> Option<Commit<'r>> {
    repo.revparse_single(rev)
        .ok()
        .and_then(|object| object.peel_to_commit().ok())
}

/// Write the commit's tree into `dest`, staging in a sibling directory first
/// so an interrupted checkout never looks complete.
fn materialize(repo: &Repository, commit: &Commit<'_>, dest: &Path) -> Result<()> {
    let staging = dest.with_extension("partial");
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("failed to clear stale checkout {:?}", staging))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create checkout directory {:?}", staging))?;

    let tree = commit.tree().context("failed to read commit tree")?;
    let mut failure: Option<anyhow::Error> = None;

    let walked = tree.walk(TreeWalkMode::PreOrder, |parent, entry| {
        let Some(name) = entry.name() else {
            return TreeWalkResult::Skip;
        };
        let path = staging.join(parent).join(name);

        let outcome = match entry.kind() {
            Some(ObjectType::Tree) => fs::create_dir_all(&path)
                .with_context(|| format!("failed to create directory {:?}", path)),
            Some(ObjectType::Blob) => write_blob(repo, entry.id(), entry.filemode(), &path),
            // Submodules are not part of the snapshot.
            _ => Ok(()),
        };

        match outcome {
            Ok(()) => TreeWalkResult::Ok,
            Err(err) => {
                failure = Some(err);
                TreeWalkResult::Abort
            }
        }
    });

    if let Some(err) = failure {
        return Err(err);
    }
    walked.context("failed to walk commit tree")?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create snapshot directory {:?}", parent))?;
    }
    fs::rename(&staging, dest)
        .with_context(|| format!("failed to move checkout into {:?}", dest))?;
    Ok(())
}

fn write_blob(repo: &Repository, id: Oid, mode: i32, path: &Path) -> Result<()> {
    let blob = repo
        .find_blob(id)
        .with_context(|| format!("missing blob {id}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {:?}", parent))?;
    }

    if mode == 0o120000 {
        let target = String::from_utf8_lossy(blob.content()).into_owned();
        return write_symlink(&target, path);
    }

    fs::write(path, blob.content()).with_context(|| format!("failed to write {:?}", path))?;

    #[cfg(unix)]
    if mode == 0o100755 {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to set permissions on {:?}", path))?;
    }

    Ok(())
}

#[cfg(unix)]
fn write_symlink(target: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)
        .with_context(|| format!("failed to create symlink {:?}", path))
}

#[cfg(not(unix))]
fn write_symlink(target: &str, path: &Path) -> Result<()> {
    fs::write(path, target).with_context(|| format!("failed to write {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn commit_file(repo: &Repository, name: &str, contents: &str, message: &str) -> Oid {
        let workdir = repo.workdir().unwrap().to_path_buf();
        fs::write(workdir.join(name), contents).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();

        let parents = match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
            Some(parent) => vec![parent],
            None => Vec::new(),
        };
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }

    fn source_repo(temp: &TempDir) -> (Repository, Url) {
        let path = temp.path().join("pkgs");
        let repo = Repository::init(&path).unwrap();
        let url = Url::from_directory_path(&path).unwrap();
        (repo, url)
    }

    #[test]
    fn fetches_head_and_materializes_tree() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let (repo, url) = source_repo(&source);
        let first = commit_file(&repo, "packages.toml", "[packages.foo]\nversion = \"1\"\n", "one");

        let fetched = fetch(cache.path(), "pkgs", &url, None).unwrap();
        assert_eq!(fetched.revision, first.to_string());
        assert!(fetched.root.join("packages.toml").exists());
        assert!(fetched.digest.starts_with("sha256-"));
    }

    #[test]
    fn pinned_revision_selects_older_commit() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let (repo, url) = source_repo(&source);
        let first = commit_file(&repo, "packages.toml", "[packages.foo]\nversion = \"1\"\n", "one");
        commit_file(&repo, "packages.toml", "[packages.foo]\nversion = \"2\"\n", "two");

        let short = &first.to_string()[..10];
        let fetched = fetch(cache.path(), "pkgs", &url, Some(short)).unwrap();
        assert_eq!(fetched.revision, first.to_string());

        let contents = fs::read_to_string(fetched.root.join("packages.toml")).unwrap();
        assert!(contents.contains("version = \"1\""));
    }

    #[test]
    fn missing_revision_is_an_error() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let (repo, url) = source_repo(&source);
        commit_file(&repo, "packages.toml", "", "one");

        let error = fetch(cache.path(), "pkgs", &url, Some("deadbeefdeadbeef"))
            .err()
            .unwrap();
        assert!(error.to_string().contains("does not exist"));
    }

    #[test]
    fn unreachable_remote_is_an_error() {
        let cache = TempDir::new().unwrap();
        let url = Url::parse("file:///nonexistent/devshell/repo").unwrap();
        assert!(fetch(cache.path(), "pkgs", &url, None).is_err());
    }

    #[test]
    fn same_commit_has_same_digest_across_caches() {
        let source = TempDir::new().unwrap();
        let (repo, url) = source_repo(&source);
        commit_file(&repo, "packages.toml", "[packages.foo]\nversion = \"1\"\n", "one");

        let cache_a = TempDir::new().unwrap();
        let cache_b = TempDir::new().unwrap();
        let a = fetch(cache_a.path(), "pkgs", &url, None).unwrap();
        let b = fetch(cache_b.path(), "pkgs", &url, None).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.revision, b.revision);
    }

    #[test]
    fn branch_pin_follows_upstream() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let (repo, url) = source_repo(&source);
        commit_file(&repo, "packages.toml", "[packages.foo]\nversion = \"1\"\n", "one");
        let branch = repo.head().unwrap().shorthand().unwrap().to_string();

        let first = fetch(cache.path(), "pkgs", &url, Some(&branch)).unwrap();
        let tip = commit_file(&repo, "packages.toml", "[packages.foo]\nversion = \"2\"\n", "two");
        let again = fetch(cache.path(), "pkgs", &url, Some(&branch)).unwrap();

        assert_ne!(first.revision, again.revision);
        assert_eq!(again.revision, tip.to_string());
    }

    #[test]
    fn known_commit_pin_skips_fetch() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let (repo, url) = source_repo(&source);
        let first = commit_file(&repo, "packages.toml", "", "one");
        fetch(cache.path(), "pkgs", &url, None).unwrap();

        // The remote disappears; a commit already in the mirror still resolves.
        drop(repo);
        fs::remove_dir_all(source.path().join("pkgs")).unwrap();
        let fetched = fetch(cache.path(), "pkgs", &url, Some(&first.to_string()[..12])).unwrap();
        assert_eq!(fetched.revision, first.to_string());

        assert!(fetch(cache.path(), "pkgs", &url, Some("main")).is_err());
    }

    #[rstest::rstest]
    #[case("abc1234", true)]
    #[case("0123456789abcdef0123456789abcdef01234567", true)]
    #[case("abc12", false)]
    #[case("main", false)]
    #[case("v1.2.0", false)]
    fn recognizes_object_ids(#[case] rev: &str, #[case] expected: bool) {
        assert_eq!(is_object_id(rev), expected);
    }
}
