use crate::cli::{Cli, Commands};
use crate::platform::PlatformId;
use crate::Workspace;
use anyhow::{Context, Result};

mod build;
mod check;
mod env;
mod lock;
mod show;

pub fn execute(cli: Cli) -> Result<()> {
    // Create workspace - this is the root entry point
    let workspace = Workspace::new(cli.manifest)?;

    match cli.command {
        Commands::Env {
            shell,
            name,
            platform,
        } => env::execute(&workspace, shell, &name, platform),

        Commands::Build {
            name,
            platforms,
            json,
        } => build::execute(&workspace, &name, &platforms, json),

        Commands::Show { platform } => show::execute(&workspace, platform),

        Commands::Lock { update } => lock::execute(&workspace, &update),

        Commands::Check => check::execute(&workspace),
    }
}

/// The platform named on the command line, or the host platform.
fn target_platform(platform: Option<String>) -> Result<PlatformId> {
    match platform {
        Some(value) => {
            PlatformId::parse(&value).with_context(|| format!("Invalid --platform '{value}'"))
        }
        None => Ok(PlatformId::current()),
    }
}
