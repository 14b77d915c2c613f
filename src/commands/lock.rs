use crate::workspace::WorkspacePath;
use crate::{ui, Workspace};
use anyhow::{Context, Result};

pub fn execute(workspace: &Workspace, update: &[String]) -> Result<()> {
    let manifest = workspace.load_manifest()?;

    if let Some(unknown) = update.iter().find(|name| !manifest.inputs.contains_key(*name)) {
        anyhow::bail!("Cannot update '{unknown}': no such input in the manifest.");
    }

    let session = workspace.session(&manifest, update)?;
    let lockfile_path = workspace.path(WorkspacePath::Lockfile);
    let mut lockfile = workspace.load_lockfile()?;

    for input in session.registry().inputs() {
        let progress = ui::Progress::new("Resolving", format!("{} ({})", input.name, input.locator));
        match session.registry().resolve(input) {
            Ok(snapshot) => {
                progress.success("Resolved", Some(format!("at {}", short_revision(&snapshot.revision))));
                lockfile.record(&snapshot);
            }
            Err(err) => {
                progress.fail("Failed", &err);
                return Err(err).with_context(|| format!("Failed to lock input '{}'", input.name));
            }
        }
    }

    lockfile.retain(|entry| manifest.inputs.contains_key(&entry.name));
    lockfile.save(&lockfile_path)?;

    ui::success(
        "Locked",
        format!(
            "{} input(s) in {}",
            manifest.inputs.len(),
            lockfile_path.display()
        ),
    );
    Ok(())
}

fn short_revision(revision: &str) -> &str {
    let hex = revision.strip_prefix("sha256-").unwrap_or(revision);
    hex.get(..12).unwrap_or(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortens_commits_and_digests() {
        assert_eq!(
            short_revision("0123456789abcdef0123456789abcdef01234567"),
            "0123456789ab"
        );
        assert_eq!(short_revision("sha256-feedfacecafebeef"), "feedfacecafe");
        assert_eq!(short_revision("abc"), "abc");
    }
}
