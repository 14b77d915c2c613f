use crate::environment::{Environment, Shell};
use crate::{ui, Workspace};
use anyhow::{Context, Result};

pub fn execute(
    workspace: &Workspace,
    shell: Option<String>,
    name: &str,
    platform: Option<String>,
) -> Result<()> {
    let platform = super::target_platform(platform)?;
    let manifest = workspace.load_manifest()?;
    let requested = manifest.shell(name)?.packages.clone();
    let session = workspace.session(&manifest, &[])?;

    // Nothing is printed unless the whole environment resolves.
    let descriptor = session
        .driver()
        .build(&platform, &requested)
        .with_context(|| format!("Failed to evaluate shell '{name}' for {platform}"))?;

    let shell = select_shell(shell.as_deref(), workspace.config().default_shell.as_deref());
    println!(
        "{}",
        Environment::from_descriptor(&descriptor).format_for_shell(shell)
    );

    Ok(())
}

fn select_shell(requested: Option<&str>, configured: Option<&str>) -> Shell {
    if let Some(name) = requested {
        return Shell::from_name(name).unwrap_or_else(|| {
            ui::warn(format!("Unknown shell '{name}'; defaulting to bash."));
            Shell::Bash
        });
    }

    configured
        .and_then(Shell::from_name)
        .or_else(|| {
            std::env::var("SHELL")
                .ok()
                .and_then(|path| Shell::from_path(&path))
        })
        .unwrap_or(Shell::Bash)
}
