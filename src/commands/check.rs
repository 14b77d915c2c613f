use crate::workspace::WorkspacePath;
use crate::{ui, Workspace};
use anyhow::Result;

pub fn execute(workspace: &Workspace) -> Result<()> {
    let manifest = workspace.load_manifest()?;
    let issues = manifest.validate();
    let location = workspace.path(WorkspacePath::Manifest);

    if issues.is_empty() {
        ui::success(
            "Check",
            format!(
                "{} is valid ({} input(s), {} overlay(s), {} shell(s)).",
                location.display(),
                manifest.inputs.len(),
                manifest.overlays.len(),
                manifest.shells.len()
            ),
        );
        Ok(())
    } else {
        for issue in &issues {
            ui::error(format!("{}: {issue}", location.display()));
        }
        anyhow::bail!("Manifest validation failed ({} issue(s)).", issues.len());
    }
}
