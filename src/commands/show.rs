use crate::{ui, Workspace};
use anyhow::{Context, Result};

pub fn execute(workspace: &Workspace, platform: Option<String>) -> Result<()> {
    let platform = super::target_platform(platform)?;
    let manifest = workspace.load_manifest()?;
    let session = workspace.session(&manifest, &[])?;

    let set = session
        .driver()
        .resolver()
        .instantiate(&platform)
        .with_context(|| format!("Failed to compose package set for {platform}"))?;

    if set.is_empty() {
        ui::info(format!("No packages available for {platform}."));
        return Ok(());
    }

    ui::status("Packages", format!("{} for {platform}", set.len()));
    for (name, def) in set.iter() {
        let version = def.fields.version.as_deref().unwrap_or("-");
        if name == def.name {
            println!("{name:<24} {version:<14} {}", def.origin);
        } else {
            println!("{name:<24} {version:<14} {} (alias of {})", def.origin, def.name);
        }
    }

    Ok(())
}
